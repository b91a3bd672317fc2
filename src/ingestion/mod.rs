//! Turning artifacts into searchable chunks.
//!
//! [`IngestionPipeline`] runs extraction, chunking, embedding, persistence and (for articles)
//! knowledge-graph extraction for one artifact, recording every step in the artifact's progress
//! log. [`IngestionQueue`] owns the durable job queue and the worker pool that drive it.

pub mod chunking;
pub mod extract;
pub mod graph;
pub mod pipeline;
pub mod progress;
pub mod queue;

use crate::catalog::CatalogError;
use crate::index::IndexError;
use crate::provider::ProviderError;
use thiserror::Error;

pub use chunking::{TextChunk, chunk_pages, estimate_tokens, split_paragraphs};
pub use extract::{ExtractedText, PageText, extract_text};
pub use graph::GraphSummary;
pub use pipeline::{IngestionOutcome, IngestionPipeline, IngestionSettings};
pub use queue::{IngestionQueue, QueueSettings, RecoveryReport};

/// Errors that end an ingestion run.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Catalog read or write failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Embedding or completion failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Chunk index rejected a write.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Knowledge graph output could not be parsed. Only raised inside the best-effort graph step.
    #[error("Knowledge graph output was not valid JSON")]
    MalformedGraph,
}

impl IngestionError {
    /// Whether a later attempt may succeed without any change to the artifact or settings.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(error) => error.is_transient(),
            Self::Index(error) => error.is_transient(),
            Self::Catalog(CatalogError::Database(_) | CatalogError::Io(_)) => true,
            Self::Catalog(_) | Self::MalformedGraph => false,
        }
    }

    /// Whether the artifact does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Catalog(error) if error.is_not_found())
    }
}
