//! Chunk storage and scoped search.
//!
//! Chunks are stored with their embedding plus the artifact fields needed to scope a query
//! (organization, division, kind, processed flag). The index query applies that scope first;
//! retrieval then re-checks every hit against the current artifact record, since the copies
//! stored with a chunk go stale when an artifact moves or is unpublished.

pub mod lexical;
pub mod memory;
pub mod qdrant;
pub mod scope;

use crate::catalog::ArtifactKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use lexical::LexicalField;
pub use memory::MemoryChunkIndex;
pub use qdrant::QdrantChunkIndex;
pub use scope::{ArtifactKinds, Scope, ScopeFilter, Visibility};

/// Errors raised by chunk index backends.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Qdrant request failed.
    #[error(transparent)]
    Qdrant(#[from] qdrant::QdrantError),
    /// Vector length does not match the index.
    #[error("Embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        /// Dimension configured for the index.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },
    /// A stored payload could not be decoded.
    #[error("Malformed chunk payload: {0}")]
    Malformed(String),
}

impl IndexError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Qdrant(error) => error.is_transient(),
            Self::DimensionMismatch { .. } | Self::Malformed(_) => false,
        }
    }
}

/// Chunk ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Owning artifact.
    pub artifact_id: Uuid,
    /// Kind of the owning artifact.
    pub artifact_kind: ArtifactKind,
    /// Tenant of the owning artifact.
    pub organization_id: Uuid,
    /// Division at ingestion time, `None` for organization-wide artifacts.
    pub division_id: Option<Uuid>,
    /// Artifact title at ingestion time.
    pub title: String,
    /// Original file name, documents only.
    pub file_name: Option<String>,
    /// Artifact summary, if any.
    pub summary: Option<String>,
    /// Ordinal within the artifact, from 0.
    pub chunk_index: usize,
    /// Chunk text.
    pub content: String,
    /// Approximate token count of `content`.
    pub token_count: usize,
    /// First page the chunk covers, from 1.
    pub page_start: u32,
    /// Last page the chunk covers.
    pub page_end: u32,
    /// Ingestion run that produced the chunk.
    pub embedding_version: i64,
    /// Embedding of `content`.
    pub embedding: Vec<f32>,
}

/// Chunk returned by a search, with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    /// Owning artifact.
    pub artifact_id: Uuid,
    /// Kind of the owning artifact.
    pub artifact_kind: ArtifactKind,
    /// Division of the owning artifact.
    pub division_id: Option<Uuid>,
    /// Artifact title.
    pub title: String,
    /// Original file name, documents only.
    pub file_name: Option<String>,
    /// Artifact summary, if any.
    pub summary: Option<String>,
    /// Ordinal within the artifact, from 0.
    pub chunk_index: usize,
    /// Chunk text.
    pub content: String,
    /// First page the chunk covers.
    pub page_start: u32,
    /// Last page the chunk covers.
    pub page_end: u32,
    /// Cosine similarity for vector hits, field weight for lexical hits.
    pub score: f32,
}

impl ChunkHit {
    /// Where the chunk sits in its artifact: a page for documents, a section for articles.
    pub fn locator(&self) -> Locator {
        match self.artifact_kind {
            ArtifactKind::Document => Locator::Page(self.page_start),
            ArtifactKind::Article => Locator::Section(self.chunk_index + 1),
        }
    }
}

/// Position of a chunk inside its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Locator {
    /// 1-based page of a document.
    Page(u32),
    /// 1-based section of an article.
    Section(usize),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(page) => write!(f, "page {page}"),
            Self::Section(section) => write!(f, "section {section}"),
        }
    }
}

/// Nearest-neighbour query.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    /// Query embedding.
    pub embedding: Vec<f32>,
    /// Visibility and kind restrictions.
    pub filter: ScopeFilter,
    /// Maximum number of hits.
    pub limit: usize,
    /// Hits below this cosine similarity are discarded.
    pub min_similarity: f32,
}

/// Case-insensitive substring query over title, file name, summary and chunk text.
#[derive(Debug, Clone)]
pub struct LexicalQuery {
    /// Substring to look for.
    pub text: String,
    /// Visibility and kind restrictions.
    pub filter: ScopeFilter,
    /// Maximum number of artifacts returned.
    pub limit: usize,
}

/// Lexical hit with the field that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    /// Matching chunk, scored with the field weight.
    pub hit: ChunkHit,
    /// Heaviest field containing the query.
    pub field: LexicalField,
}

/// Storage of chunk embeddings with scoped search.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Create backing structures if missing.
    async fn prepare(&self) -> Result<(), IndexError>;

    /// Remove every chunk of an artifact.
    async fn delete_artifact(&self, artifact_id: Uuid) -> Result<(), IndexError>;

    /// Persist chunks. They stay invisible to searches until [`Self::mark_processed`].
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError>;

    /// Make an artifact's chunks visible to searches.
    async fn mark_processed(&self, artifact_id: Uuid) -> Result<(), IndexError>;

    /// Rank visible chunks by cosine similarity.
    async fn vector_search(&self, query: VectorQuery) -> Result<Vec<ChunkHit>, IndexError>;

    /// Find visible chunks whose text or artifact metadata contains the query.
    ///
    /// Every match in scope is considered before ranking: one hit per artifact, heaviest field
    /// first, cut to the query limit.
    async fn lexical_search(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>, IndexError>;

    /// Number of stored chunks for an artifact, visible or not.
    async fn count_chunks(&self, artifact_id: Uuid) -> Result<usize, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(kind: ArtifactKind, chunk_index: usize, page_start: u32) -> ChunkHit {
        ChunkHit {
            artifact_id: Uuid::nil(),
            artifact_kind: kind,
            division_id: None,
            title: "t".into(),
            file_name: None,
            summary: None,
            chunk_index,
            content: String::new(),
            page_start,
            page_end: page_start,
            score: 0.5,
        }
    }

    #[test]
    fn locator_depends_on_artifact_kind() {
        assert_eq!(hit(ArtifactKind::Document, 4, 3).locator(), Locator::Page(3));
        assert_eq!(hit(ArtifactKind::Article, 4, 1).locator(), Locator::Section(5));
        assert_eq!(Locator::Page(3).to_string(), "page 3");
    }
}
