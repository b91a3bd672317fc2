//! HTTP surface of the knowledge subsystem.
//!
//! - `POST /artifacts/:id/ingest` – Queue an artifact for (re)processing; answers 202 at once.
//! - `GET /artifacts/:id/status` – Processing status, progress log, processed flag and error.
//! - `POST /artifacts/:id/chat` – Server-sent answer about one artifact.
//! - `POST /rag/query` – Server-sent answer over everything the caller may see.
//! - `POST /search` – Hybrid search results for the caller.
//! - `POST /organizations/:id/uploads/describe` – Suggested metadata for a raw upload.
//! - `GET /metrics` – Ingestion and answering counters.
//! - `GET /commands` – Machine-readable command catalog.
//!
//! Streaming endpoints emit `token` events while the model writes, then `citations`, and always
//! finish with `done`. A failed turn sends an `error` event with a message fit for end users
//! before `done`. Closing the connection cancels generation.

use crate::catalog::CallerIdentity;
use crate::index::ArtifactKinds;
use crate::rag::{ChatTurn, Citation, RagRequest};
use crate::service::{ANSWER_FAILED_MESSAGE, ErrorClass, KnowledgeApi, ServiceError};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TOKEN_BUFFER: usize = 64;

/// Build the HTTP router.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: KnowledgeApi + 'static,
{
    Router::new()
        .route("/artifacts/:id/ingest", post(trigger_ingestion::<S>))
        .route("/artifacts/:id/status", get(artifact_status::<S>))
        .route("/artifacts/:id/chat", post(chat::<S>))
        .route("/rag/query", post(rag_query::<S>))
        .route("/search", post(search::<S>))
        .route(
            "/organizations/:id/uploads/describe",
            post(describe_upload::<S>),
        )
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

#[derive(Serialize)]
struct IngestResponse {
    artifact_id: Uuid,
    queued: bool,
}

async fn trigger_ingestion<S>(
    State(service): State<Arc<S>>,
    Path(artifact_id): Path<Uuid>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError>
where
    S: KnowledgeApi,
{
    let queued = service.trigger_ingestion(artifact_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            artifact_id,
            queued,
        }),
    ))
}

async fn artifact_status<S>(
    State(service): State<Arc<S>>,
    Path(artifact_id): Path<Uuid>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let status = service.artifact_status(artifact_id).await?;
    Ok(Json(status).into_response())
}

/// Request body for `POST /artifacts/:id/chat`.
#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn chat<S>(
    State(service): State<Arc<S>>,
    Path(artifact_id): Path<Uuid>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: KnowledgeApi + 'static,
{
    answer_stream(move |sink, cancel| async move {
        service
            .chat_single_scope(artifact_id, request.question, request.history, sink, cancel)
            .await
    })
}

async fn rag_query<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<RagRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: KnowledgeApi + 'static,
{
    answer_stream(move |sink, cancel| async move {
        service.rag_query(request, sink, cancel).await
    })
}

/// Run an answer in its own task and relay it as server-sent events.
///
/// The response stream owns a drop guard on the cancellation token, so a client that disconnects
/// stops generation.
fn answer_stream<F, Fut>(run: F) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    F: FnOnce(mpsc::Sender<String>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Vec<Citation>, ServiceError>> + Send + 'static,
{
    let (sink, mut tokens) = mpsc::channel::<String>(TOKEN_BUFFER);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(sink, cancel.clone()));
    let guard = cancel.drop_guard();

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(token) = tokens.recv().await {
            yield Ok(Event::default().event("token").data(token));
        }
        match task.await {
            Ok(Ok(citations)) => {
                let event = Event::default()
                    .event("citations")
                    .json_data(&citations)
                    .unwrap_or_else(|_| Event::default().event("citations").data("[]"));
                yield Ok(event);
            }
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "Answer failed");
                yield Ok(Event::default().event("error").data(error.user_message()));
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "Answer task aborted");
                yield Ok(Event::default().event("error").data(ANSWER_FAILED_MESSAGE));
            }
        }
        yield Ok(Event::default().event("done").data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Request body for `POST /search`.
#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    caller: CallerIdentity,
    #[serde(default)]
    kinds: ArtifactKinds,
}

async fn search<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let organization_id = request.caller.organization_id;
    let results = service
        .hybrid_search(request.query, request.caller, request.kinds)
        .await?;
    tracing::info!(organization_id = %organization_id, results = results.len(), "Search completed");
    Ok(Json(json!({ "results": results })).into_response())
}

#[derive(Deserialize)]
struct DescribeParams {
    file_name: String,
    #[serde(default = "default_media_type")]
    media_type: String,
}

fn default_media_type() -> String {
    "application/octet-stream".to_string()
}

async fn describe_upload<S>(
    State(service): State<Arc<S>>,
    Path(organization_id): Path<Uuid>,
    Query(params): Query<DescribeParams>,
    body: Bytes,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let metadata = service
        .describe_upload(
            organization_id,
            params.file_name,
            params.media_type,
            body.to_vec(),
        )
        .await?;
    Ok(Json(metadata).into_response())
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Response
where
    S: KnowledgeApi,
{
    Json(service.metrics_snapshot()).into_response()
}

#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

async fn get_commands() -> Json<CommandsResponse> {
    let caller = json!({
        "user_id": "00000000-0000-0000-0000-000000000064",
        "organization_id": "00000000-0000-0000-0000-000000000001",
        "division_id": null,
        "role": "member"
    });
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/artifacts/:id/ingest",
                description: "Queue an artifact for processing. Returns 202 with { \"artifact_id\", \"queued\" }; poll the status endpoint for progress.",
                request_example: None,
            },
            CommandDescriptor {
                name: "status",
                method: "GET",
                path: "/artifacts/:id/status",
                description: "Processing status, timestamped progress log, processed flag and last error of an artifact.",
                request_example: None,
            },
            CommandDescriptor {
                name: "chat",
                method: "POST",
                path: "/artifacts/:id/chat",
                description: "Stream an answer restricted to one artifact as server-sent events (token, citations, error, done).",
                request_example: Some(json!({
                    "question": "What changed in the pricing?",
                    "history": [{ "role": "user", "content": "Hi" }, { "role": "assistant", "content": "Hello!" }]
                })),
            },
            CommandDescriptor {
                name: "rag_query",
                method: "POST",
                path: "/rag/query",
                description: "Stream an answer grounded in every artifact the caller may see, followed by citations.",
                request_example: Some(json!({
                    "question": "How many remote days are allowed?",
                    "history": [],
                    "caller": caller,
                    "kinds": "all"
                })),
            },
            CommandDescriptor {
                name: "search",
                method: "POST",
                path: "/search",
                description: "Hybrid vector and keyword search over the caller's artifacts, one result per artifact.",
                request_example: Some(json!({ "query": "expense policy", "caller": caller })),
            },
            CommandDescriptor {
                name: "describe_upload",
                method: "POST",
                path: "/organizations/:id/uploads/describe?file_name=report.pdf&media_type=application/pdf",
                description: "Suggest title, summary, tags, language and type for raw file bytes sent as the body.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return ingestion and answering counters.",
                request_example: None,
            },
        ],
    })
}

struct AppError(ServiceError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.class() {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Upstream => StatusCode::BAD_GATEWAY,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(inner: ServiceError) -> Self {
        Self(inner)
    }
}
