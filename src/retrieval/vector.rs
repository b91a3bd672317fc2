//! Embedding-based retrieval.

use super::{RetrievalError, SearchLimits, current_hits};
use crate::catalog::ArtifactRepository;
use crate::index::{ChunkHit, ChunkIndex, ScopeFilter, VectorQuery};
use crate::provider::ModelProvider;
use std::sync::Arc;

/// Ranks visible chunks against a query embedding.
#[derive(Clone)]
pub struct VectorRetriever {
    index: Arc<dyn ChunkIndex>,
    artifacts: Arc<dyn ArtifactRepository>,
}

impl VectorRetriever {
    /// Retriever searching `index` and checking hits against `artifacts`.
    pub fn new(index: Arc<dyn ChunkIndex>, artifacts: Arc<dyn ArtifactRepository>) -> Self {
        Self { index, artifacts }
    }

    /// Embed `query` with the organization's provider and return the closest chunks in `filter`,
    /// best first.
    pub async fn retrieve(
        &self,
        provider: &dyn ModelProvider,
        query: &str,
        filter: ScopeFilter,
        limits: SearchLimits,
    ) -> Result<Vec<ChunkHit>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        let embedding = provider.generate_embedding(query).await?;
        let hits = self
            .index
            .vector_search(VectorQuery {
                embedding,
                filter,
                limit: limits.top_k,
                min_similarity: limits.min_similarity,
            })
            .await?;
        let hits = current_hits(self.artifacts.as_ref(), &filter, hits).await?;
        tracing::debug!(
            organization_id = %filter.scope.organization_id,
            hits = hits.len(),
            "Vector retrieval finished"
        );
        Ok(hits)
    }
}
