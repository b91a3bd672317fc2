use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustykb::catalog::{CallerIdentity, Role};
use rustykb::config;
use rustykb::index::ArtifactKinds;
use rustykb::logging;
use rustykb::service::{KnowledgeApi, KnowledgeService};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "rustykb-admin",
    about = "Operator commands for the knowledge-base ingestion queue and index"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process an artifact now, in this process.
    Ingest { artifact_id: Uuid },
    /// Queue an artifact for the server's workers.
    Enqueue { artifact_id: Uuid },
    /// Print an artifact's status and progress log.
    Status { artifact_id: Uuid },
    /// Requeue interrupted jobs and stranded artifacts, then drain the queue.
    Recover {
        /// Only requeue; leave processing to the server.
        #[arg(long)]
        no_drain: bool,
    },
    /// Run a hybrid search as the given caller.
    Search {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "admin")]
        role: String,
        #[arg(long)]
        division: Option<Uuid>,
        #[arg(long, default_value = "all")]
        kinds: String,
        query: String,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    config::init_config();
    logging::init_tracing("warn");
    let service = KnowledgeService::from_config(config::get_config())
        .await
        .context("Failed to initialize knowledge service")?;

    match cli.command {
        Command::Ingest { artifact_id } => {
            let outcome = service.ingest_now(artifact_id).await?;
            print_json(&outcome)
        }
        Command::Enqueue { artifact_id } => {
            let queued = service.trigger_ingestion(artifact_id).await?;
            println!(
                "{}",
                if queued {
                    "queued"
                } else {
                    "already queued"
                }
            );
            Ok(())
        }
        Command::Status { artifact_id } => {
            let status = service.artifact_status(artifact_id).await?;
            print_json(&status)
        }
        Command::Recover { no_drain } => {
            let report = service.queue().recover().await?;
            print_json(&report)?;
            if !no_drain {
                let processed = service.queue().run_pending().await?;
                println!("processed {processed} job(s)");
            }
            Ok(())
        }
        Command::Search {
            organization,
            user,
            role,
            division,
            kinds,
            query,
        } => {
            let caller = CallerIdentity {
                user_id: user,
                organization_id: organization,
                division_id: division,
                role: role.parse::<Role>().map_err(|err| anyhow!(err))?,
            };
            let kinds: ArtifactKinds = serde_json::from_value(serde_json::Value::String(kinds))
                .context("--kinds must be one of all, documents, articles")?;
            let results = service.hybrid_search(query, caller, kinds).await?;
            print_json(&results)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}
