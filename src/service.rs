//! Composition root tying catalog, index, providers, ingestion and answering together.

use crate::catalog::{
    ArtifactRepository, ArtifactSource, ArtifactStatus, CallerIdentity, CatalogError,
    CredentialVault, JobStore, OrganizationDirectory, PlaintextVault, SqliteCatalog,
    UsageRecorder,
};
use crate::config::{ChunkStoreBackend, Config};
use crate::index::{ArtifactKinds, ChunkIndex, IndexError, MemoryChunkIndex, QdrantChunkIndex};
use crate::index::qdrant::{QdrantError, QdrantService};
use crate::ingestion::{
    IngestionError, IngestionOutcome, IngestionPipeline, IngestionQueue, IngestionSettings,
    QueueSettings, extract_text,
};
use crate::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::provider::{
    DirectoryProviderResolver, DocumentMetadata, ManagedProviderSettings, MetadataRequest,
    ProviderError, ProviderResolver, RetryPolicy, TokenSink,
};
use crate::rag::{ChatTurn, Citation, RagError, RagOrchestrator, RagRequest, RagSettings};
use crate::retrieval::{HybridSearch, RetrievalError, SearchLimits, SearchResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Message shown to users when a conversation turn fails.
pub const ANSWER_FAILED_MESSAGE: &str = "The answer could not be generated. Please try asking again.";

/// Errors surfaced to the HTTP layer and the admin CLI.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Ingestion run failed.
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    /// Retrieval failed.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    /// Answer generation failed.
    #[error(transparent)]
    Rag(#[from] RagError),
    /// Provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Catalog lookup or write failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Chunk index request failed.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Malformed caller input.
    #[error("Invalid request: {0}")]
    InvalidInput(String),
}

/// How the caller should be told about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The referenced record does not exist.
    NotFound,
    /// The request itself is invalid.
    BadRequest,
    /// A model provider or the chunk store misbehaved.
    Upstream,
    /// Anything else.
    Internal,
}

impl ServiceError {
    /// Classify the error for the transport layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Ingestion(error) if error.is_not_found() => ErrorClass::NotFound,
            Self::Rag(error) if error.is_not_found() => ErrorClass::NotFound,
            Self::Catalog(error) if error.is_not_found() => ErrorClass::NotFound,
            Self::InvalidInput(_)
            | Self::Retrieval(RetrievalError::EmptyQuery)
            | Self::Rag(RagError::EmptyQuestion) => ErrorClass::BadRequest,
            Self::Provider(_)
            | Self::Rag(RagError::Provider(_))
            | Self::Retrieval(RetrievalError::Provider(_))
            | Self::Ingestion(IngestionError::Provider(_)) => ErrorClass::Upstream,
            _ => ErrorClass::Internal,
        }
    }

    /// Text safe to show an end user.
    pub fn user_message(&self) -> String {
        match (self, self.class()) {
            (_, ErrorClass::NotFound | ErrorClass::BadRequest) => self.to_string(),
            (Self::Rag(_), _) => ANSWER_FAILED_MESSAGE.to_string(),
            (Self::Ingestion(error), _) => format!("Processing failed: {error}"),
            _ => self.to_string(),
        }
    }
}

/// Operations offered to the CRUD layer.
#[async_trait]
pub trait KnowledgeApi: Send + Sync {
    /// Queue an artifact for (re)processing. Returns `false` if a job was already waiting.
    async fn trigger_ingestion(&self, artifact_id: Uuid) -> Result<bool, ServiceError>;

    /// Processing status and progress log.
    async fn artifact_status(&self, artifact_id: Uuid) -> Result<ArtifactStatus, ServiceError>;

    /// Stream an answer about one artifact.
    async fn chat_single_scope(
        &self,
        artifact_id: Uuid,
        question: String,
        history: Vec<ChatTurn>,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<Vec<Citation>, ServiceError>;

    /// Stream an answer over everything the caller may see.
    async fn rag_query(
        &self,
        request: RagRequest,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<Vec<Citation>, ServiceError>;

    /// Ranked search results for the caller.
    async fn hybrid_search(
        &self,
        query: String,
        caller: CallerIdentity,
        kinds: ArtifactKinds,
    ) -> Result<Vec<SearchResult>, ServiceError>;

    /// Suggest metadata for a file before it becomes an artifact.
    async fn describe_upload(
        &self,
        organization_id: Uuid,
        file_name: String,
        media_type: String,
        bytes: Vec<u8>,
    ) -> Result<DocumentMetadata, ServiceError>;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Tunables for every component.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Extraction, chunking and embedding.
    pub ingestion: IngestionSettings,
    /// Worker pool and retries.
    pub queue: QueueSettings,
    /// Answer retrieval limits.
    pub rag: RagSettings,
    /// Hybrid search limits.
    pub search: SearchLimits,
    /// Provider call retries.
    pub retry: RetryPolicy,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            ingestion: IngestionSettings::default(),
            queue: QueueSettings::default(),
            rag: RagSettings::default(),
            search: SearchLimits::new(20, 0.5),
            retry: RetryPolicy::default(),
        }
    }
}

impl ServiceSettings {
    /// Settings from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            ingestion: IngestionSettings::from_config(config),
            queue: QueueSettings::from_config(config),
            rag: RagSettings::from_config(config),
            search: SearchLimits::search(config),
            retry: RetryPolicy::new(
                config.retry_max_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
        }
    }
}

/// Collaborators owned by the surrounding application.
#[derive(Clone)]
pub struct Collaborators {
    /// Artifact records and processing state.
    pub artifacts: Arc<dyn ArtifactRepository>,
    /// Organization settings.
    pub directory: Arc<dyn OrganizationDirectory>,
    /// Usage sink.
    pub usage: Arc<dyn UsageRecorder>,
    /// Ingestion job queue.
    pub jobs: Arc<dyn JobStore>,
}

impl Collaborators {
    /// Every collaborator served by one SQLite catalog.
    pub fn from_catalog(catalog: Arc<SqliteCatalog>) -> Self {
        Self {
            artifacts: catalog.clone(),
            directory: catalog.clone(),
            usage: catalog.clone(),
            jobs: catalog,
        }
    }
}

/// The knowledge subsystem behind [`KnowledgeApi`].
pub struct KnowledgeService {
    collaborators: Collaborators,
    providers: Arc<dyn ProviderResolver>,
    queue: Arc<IngestionQueue>,
    search: HybridSearch,
    rag: RagOrchestrator,
    metrics: Arc<ServiceMetrics>,
}

impl KnowledgeService {
    /// Wire the service from explicit parts.
    pub fn new(
        collaborators: Collaborators,
        index: Arc<dyn ChunkIndex>,
        providers: Arc<dyn ProviderResolver>,
        settings: ServiceSettings,
    ) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&collaborators.artifacts),
            Arc::clone(&collaborators.usage),
            Arc::clone(&index),
            Arc::clone(&providers),
            Arc::clone(&metrics),
            settings.ingestion,
        ));
        let queue = Arc::new(IngestionQueue::new(
            Arc::clone(&collaborators.jobs),
            Arc::clone(&collaborators.artifacts),
            pipeline,
            settings.queue,
        ));
        let search = HybridSearch::new(
            Arc::clone(&index),
            Arc::clone(&collaborators.artifacts),
            Arc::clone(&collaborators.directory),
            Arc::clone(&providers),
            settings.search,
        );
        let rag = RagOrchestrator::new(
            Arc::clone(&collaborators.artifacts),
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.usage),
            Arc::clone(&providers),
            index,
            Arc::clone(&metrics),
            settings.rag,
        );
        Self {
            collaborators,
            providers,
            queue,
            search,
            rag,
            metrics,
        }
    }

    /// Build the service described by process configuration: SQLite catalog, configured chunk
    /// store and the directory-backed provider resolver.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let catalog = Arc::new(SqliteCatalog::open(Path::new(&config.catalog_path))?);
        let index: Arc<dyn ChunkIndex> = match config.chunk_store {
            ChunkStoreBackend::Qdrant => {
                let service = QdrantService::new(&config.qdrant_url, config.qdrant_api_key.clone())
                    .map_err(|error: QdrantError| ServiceError::Index(error.into()))?;
                Arc::new(QdrantChunkIndex::new(
                    service,
                    config.qdrant_collection_name.clone(),
                    config.embedding_dimension,
                ))
            }
            ChunkStoreBackend::Memory => Arc::new(MemoryChunkIndex::new(config.embedding_dimension)),
        };
        index.prepare().await?;
        tracing::info!(store = ?config.chunk_store, "Chunk store ready");

        let settings = ServiceSettings::from_config(config);
        let vault: Arc<dyn CredentialVault> = Arc::new(PlaintextVault);
        let providers = Arc::new(DirectoryProviderResolver::new(
            catalog.clone(),
            vault,
            ManagedProviderSettings::from_config(config),
            settings.retry,
        )?);

        Ok(Self::new(
            Collaborators::from_catalog(catalog),
            index,
            providers,
            settings,
        ))
    }

    /// Ingestion queue, for recovery and the worker pool.
    pub fn queue(&self) -> &Arc<IngestionQueue> {
        &self.queue
    }

    /// Run ingestion in the calling task instead of the worker pool.
    pub async fn ingest_now(&self, artifact_id: Uuid) -> Result<IngestionOutcome, ServiceError> {
        Ok(self.queue.run_now(artifact_id).await?)
    }
}

#[async_trait]
impl KnowledgeApi for KnowledgeService {
    async fn trigger_ingestion(&self, artifact_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.queue.trigger(artifact_id).await?)
    }

    async fn artifact_status(&self, artifact_id: Uuid) -> Result<ArtifactStatus, ServiceError> {
        Ok(self.collaborators.artifacts.status(artifact_id).await?)
    }

    async fn chat_single_scope(
        &self,
        artifact_id: Uuid,
        question: String,
        history: Vec<ChatTurn>,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<Vec<Citation>, ServiceError> {
        Ok(self
            .rag
            .chat_single_scope(artifact_id, &question, &history, &sink, &cancel)
            .await?)
    }

    async fn rag_query(
        &self,
        request: RagRequest,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<Vec<Citation>, ServiceError> {
        Ok(self.rag.answer(&request, &sink, &cancel).await?)
    }

    async fn hybrid_search(
        &self,
        query: String,
        caller: CallerIdentity,
        kinds: ArtifactKinds,
    ) -> Result<Vec<SearchResult>, ServiceError> {
        Ok(self.search.search(&query, &caller, kinds).await?)
    }

    async fn describe_upload(
        &self,
        organization_id: Uuid,
        file_name: String,
        media_type: String,
        bytes: Vec<u8>,
    ) -> Result<DocumentMetadata, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::InvalidInput("upload is empty".into()));
        }
        let source = ArtifactSource {
            bytes,
            media_type,
            file_name: Some(file_name.clone()),
        };
        let extracted = extract_text(&source).await;
        let provider = self.providers.resolve(organization_id).await?;
        let request = MetadataRequest {
            text: (!extracted.placeholder).then_some(extracted.full_text.as_str()),
            raw_file: Some(source.bytes.as_slice()),
            file_name: &file_name,
        };
        Ok(provider.generate_document_metadata(request).await?)
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
