//! Scoped retrieval over the chunk index.
//!
//! [`VectorRetriever`] embeds a query and ranks chunks by cosine similarity. [`HybridSearch`] runs
//! that next to a lexical lookup and merges both per artifact for the search box. Both re-check
//! index hits against the current artifact records with [`current_hits`].

pub mod hybrid;
pub mod vector;

use crate::catalog::{ArtifactRecord, ArtifactRepository, CatalogError};
use crate::config::Config;
use crate::index::{ChunkHit, IndexError, ScopeFilter};
use crate::provider::ProviderError;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use hybrid::{HybridSearch, MatchSource, SearchResult, merge_results};
pub use vector::VectorRetriever;

/// Characters of chunk text shown in citations and search results.
pub const EXCERPT_CHARS: usize = 200;

/// Errors raised while retrieving chunks.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Embedding the query failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The chunk index rejected the query.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Policy or artifact lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The query was blank.
    #[error("Search query is empty")]
    EmptyQuery,
}

/// Result cap and similarity floor for one kind of caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchLimits {
    /// Maximum number of hits.
    pub top_k: usize,
    /// Vector hits below this cosine similarity are dropped.
    pub min_similarity: f32,
}

impl SearchLimits {
    /// Limits returning at most `top_k` hits at or above `min_similarity`.
    pub const fn new(top_k: usize, min_similarity: f32) -> Self {
        Self {
            top_k,
            min_similarity,
        }
    }

    /// Organization-wide answers.
    pub fn rag(config: &Config) -> Self {
        Self::new(config.rag_top_k, config.rag_min_similarity)
    }

    /// Single-artifact chat.
    pub fn chat(config: &Config) -> Self {
        Self::new(config.chat_top_k, config.chat_min_similarity)
    }

    /// Hybrid search page.
    pub fn search(config: &Config) -> Self {
        Self::new(config.search_page_size, config.search_min_similarity)
    }
}

/// Keep the hits whose artifact still passes `filter` as currently stored, refreshing the
/// artifact fields copied into each chunk.
///
/// Hits of deleted, unprocessed or unpublished artifacts are dropped, as are hits of artifacts
/// that moved out of the caller's scope since they were indexed.
pub async fn current_hits(
    artifacts: &dyn ArtifactRepository,
    filter: &ScopeFilter,
    hits: Vec<ChunkHit>,
) -> Result<Vec<ChunkHit>, RetrievalError> {
    if hits.is_empty() {
        return Ok(hits);
    }
    let mut ids: Vec<Uuid> = hits.iter().map(|hit| hit.artifact_id).collect();
    ids.sort_unstable();
    ids.dedup();
    let records: HashMap<Uuid, ArtifactRecord> = artifacts
        .artifacts(&ids)
        .await?
        .into_iter()
        .map(|record| (record.id, record))
        .collect();

    let found = hits.len();
    let current: Vec<ChunkHit> = hits
        .into_iter()
        .filter_map(|hit| {
            let record = records.get(&hit.artifact_id)?;
            let admitted = record.published
                && filter.admits(
                    record.organization_id,
                    record.division_id,
                    record.kind,
                    record.id,
                    record.processed,
                );
            admitted.then(|| ChunkHit {
                division_id: record.division_id,
                title: record.title.clone(),
                file_name: record.file_name.clone(),
                summary: record.summary.clone(),
                ..hit
            })
        })
        .collect();
    if current.len() < found {
        tracing::debug!(
            organization_id = %filter.scope.organization_id,
            dropped = found - current.len(),
            "Dropped hits of artifacts no longer visible"
        );
    }
    Ok(current)
}

/// First `max_chars` characters of `text`, whitespace collapsed.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", &collapsed[..end]),
        None => collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_collapses_whitespace_and_truncates_on_char_boundaries() {
        assert_eq!(excerpt("a\n\n b  c", 10), "a b c");
        assert_eq!(excerpt("äöüäöü", 3), "äöü…");
        assert_eq!(excerpt(&"x".repeat(250), EXCERPT_CHARS).chars().count(), 201);
    }
}
