use anyhow::Context;
use rustykb::{api, config, logging, service::KnowledgeService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing("info");

    let service = Arc::new(
        KnowledgeService::from_config(config::get_config())
            .await
            .context("Failed to initialize knowledge service")?,
    );
    let report = service
        .queue()
        .recover()
        .await
        .context("Failed to recover ingestion queue")?;
    tracing::info!(
        requeued_jobs = report.requeued_jobs,
        reenqueued_artifacts = report.reenqueued_artifacts,
        "Ingestion queue ready"
    );

    let shutdown = CancellationToken::new();
    let workers = service.queue().start(shutdown.clone());
    let app = api::create_router(Arc::clone(&service));

    let (listener, port) = bind_listener().await.context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    for worker in workers {
        if let Err(error) = worker.await {
            tracing::warn!(error = %error, "Ingestion worker ended abnormally");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::warn!(error = %error, "Failed to listen for shutdown signal");
            }
        }
        () = shutdown.cancelled() => {}
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
