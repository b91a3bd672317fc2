//! Narrow interfaces to the collaborators that own artifacts, organizations and jobs.
//!
//! The RAG core never talks to storage directly. It reads artifacts and organization settings,
//! appends progress, records usage and manages ingestion jobs through the traits below;
//! [`SqliteCatalog`] is the adapter shipped with the server.

pub mod sqlite;
pub mod types;
pub mod vault;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteCatalog;
pub use types::{
    ArtifactKind, ArtifactRecord, ArtifactSource, ArtifactStatus, CallerIdentity, IngestionJob,
    KnowledgeEntity, NewArtifact, OrganizationPolicy, ProcessingStatus, ProgressEntry,
    ProviderMode, ProviderSettings, ResolvedRelationship, Role, UsageEvent,
};
pub use vault::{CredentialVault, PlaintextVault, VaultError};

/// Errors surfaced by catalog collaborators.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record type, e.g. `artifact`.
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },
    /// The underlying database reported an error.
    #[error("Catalog database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A stored value could not be decoded.
    #[error("Corrupt catalog value: {0}")]
    Corrupt(String),
    /// The connection mutex was poisoned by a panicking holder.
    #[error("Catalog connection lock poisoned")]
    Poisoned,
    /// Filesystem error while opening the catalog.
    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Whether the error means the record is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Artifact records and their processing state.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Load the artifact record.
    async fn artifact(&self, id: Uuid) -> Result<ArtifactRecord, CatalogError>;

    /// Load the current records of several artifacts. Unknown ids are skipped.
    async fn artifacts(&self, ids: &[Uuid]) -> Result<Vec<ArtifactRecord>, CatalogError>;

    /// Load the raw content to ingest.
    async fn load_source(&self, id: Uuid) -> Result<ArtifactSource, CatalogError>;

    /// Current status and progress log.
    async fn status(&self, id: Uuid) -> Result<ArtifactStatus, CatalogError>;

    /// Enter `processing`: clear the error and the processed flag.
    async fn begin_processing(&self, id: Uuid) -> Result<(), CatalogError>;

    /// Atomically append one entry to the progress log.
    async fn append_progress(&self, id: Uuid, entry: &ProgressEntry) -> Result<(), CatalogError>;

    /// Record the embedding model used for the current run.
    async fn record_embedding_model(&self, id: Uuid, model: &str) -> Result<(), CatalogError>;

    /// Enter `completed`, set processed, clear the error and bump the embedding version.
    /// Returns the new version.
    async fn complete_processing(&self, id: Uuid) -> Result<i64, CatalogError>;

    /// Enter `failed` with the given message.
    async fn fail_processing(&self, id: Uuid, message: &str) -> Result<(), CatalogError>;

    /// Artifacts currently in the given status.
    async fn artifacts_in_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Uuid>, CatalogError>;

    /// Replace the artifact's knowledge graph entities, returning their ids by name.
    async fn replace_entities(
        &self,
        artifact_id: Uuid,
        entities: &[KnowledgeEntity],
    ) -> Result<HashMap<String, Uuid>, CatalogError>;

    /// Persist relationships between entities written by [`Self::replace_entities`].
    async fn insert_relationships(
        &self,
        artifact_id: Uuid,
        relationships: &[ResolvedRelationship],
    ) -> Result<(), CatalogError>;
}

/// Organization-owned settings read at request time.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Active provider configuration.
    async fn provider_settings(
        &self,
        organization_id: Uuid,
    ) -> Result<ProviderSettings, CatalogError>;

    /// Scoping policy.
    async fn policy(&self, organization_id: Uuid) -> Result<OrganizationPolicy, CatalogError>;

    /// Display names of the organization's divisions.
    async fn division_names(
        &self,
        organization_id: Uuid,
    ) -> Result<HashMap<Uuid, String>, CatalogError>;
}

/// Usage and audit sink.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    /// Persist one usage event.
    async fn record_usage(&self, event: UsageEvent) -> Result<(), CatalogError>;
}

/// Durable ingestion job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Queue a job unless one is already queued for the artifact. Returns whether a row was added.
    async fn enqueue(&self, artifact_id: Uuid) -> Result<bool, CatalogError>;

    /// Atomically claim the oldest due job.
    async fn claim_next(&self) -> Result<Option<IngestionJob>, CatalogError>;

    /// Mark a job done.
    async fn complete_job(&self, job_id: i64) -> Result<(), CatalogError>;

    /// Put a job back in the queue after `delay`, counting the failed attempt.
    async fn reschedule_job(
        &self,
        job_id: i64,
        error: &str,
        delay: Duration,
    ) -> Result<(), CatalogError>;

    /// Give up on a job.
    async fn abandon_job(&self, job_id: i64, error: &str) -> Result<(), CatalogError>;

    /// Return jobs left `running` by a previous process to the queue.
    async fn requeue_interrupted(&self) -> Result<usize, CatalogError>;
}
