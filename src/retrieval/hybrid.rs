//! Search box backend: vector and lexical retrieval merged per artifact.

use super::vector::VectorRetriever;
use super::{EXCERPT_CHARS, RetrievalError, SearchLimits, current_hits, excerpt};
use crate::catalog::{ArtifactKind, ArtifactRepository, CallerIdentity, OrganizationDirectory};
use crate::index::{
    ArtifactKinds, ChunkHit, ChunkIndex, LexicalQuery, Locator, Scope, ScopeFilter,
};
use crate::provider::ProviderResolver;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Multiplier applied when both branches found the same artifact.
pub const BOTH_SOURCES_BOOST: f32 = 1.2;

/// Which branch produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    /// Embedding similarity only.
    Vector,
    /// Substring match only.
    Lexical,
    /// Found by both branches; the score is boosted.
    Both,
}

/// One artifact in the search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Matching artifact.
    pub artifact_id: Uuid,
    /// Document or article.
    pub kind: ArtifactKind,
    /// Current artifact title.
    pub title: String,
    /// Current division, `None` for organization-wide artifacts.
    pub division_id: Option<Uuid>,
    /// Relevance in `0..=1`.
    pub score: f32,
    /// Branch that found the artifact.
    pub source: MatchSource,
    /// Position of the representative chunk.
    pub locator: Locator,
    /// Start of the representative chunk.
    pub excerpt: String,
}

impl SearchResult {
    fn from_hit(hit: &ChunkHit, source: MatchSource) -> Self {
        Self {
            artifact_id: hit.artifact_id,
            kind: hit.artifact_kind,
            title: hit.title.clone(),
            division_id: hit.division_id,
            score: hit.score,
            source,
            locator: hit.locator(),
            excerpt: excerpt(&hit.content, EXCERPT_CHARS),
        }
    }
}

/// Keep the best-scoring hit of every artifact, preserving first-seen order.
fn collapse(hits: Vec<ChunkHit>) -> Vec<ChunkHit> {
    let mut order = Vec::new();
    let mut best: HashMap<Uuid, ChunkHit> = HashMap::new();
    for hit in hits {
        match best.get_mut(&hit.artifact_id) {
            Some(current) if current.score >= hit.score => {}
            Some(current) => *current = hit,
            None => {
                order.push(hit.artifact_id);
                best.insert(hit.artifact_id, hit);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|artifact_id| best.remove(&artifact_id))
        .collect()
}

/// Merge vector and lexical hits into one ranked list per artifact.
///
/// An artifact found by both keeps the vector locator and excerpt and scores
/// `min(1, max(vector, lexical) * 1.2)`.
pub fn merge_results(
    vector: Vec<ChunkHit>,
    lexical: Vec<ChunkHit>,
    limit: usize,
) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = collapse(vector)
        .iter()
        .map(|hit| SearchResult::from_hit(hit, MatchSource::Vector))
        .collect();
    let positions: HashMap<Uuid, usize> = merged
        .iter()
        .enumerate()
        .map(|(position, result)| (result.artifact_id, position))
        .collect();

    for hit in collapse(lexical) {
        match positions.get(&hit.artifact_id) {
            Some(&position) => {
                let result = &mut merged[position];
                result.score = (result.score.max(hit.score) * BOTH_SOURCES_BOOST).min(1.0);
                result.source = MatchSource::Both;
            }
            None => merged.push(SearchResult::from_hit(&hit, MatchSource::Lexical)),
        }
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    merged.truncate(limit);
    merged
}

/// Hybrid search scoped to the caller.
pub struct HybridSearch {
    index: Arc<dyn ChunkIndex>,
    artifacts: Arc<dyn ArtifactRepository>,
    retriever: VectorRetriever,
    directory: Arc<dyn OrganizationDirectory>,
    providers: Arc<dyn ProviderResolver>,
    limits: SearchLimits,
}

impl HybridSearch {
    /// Search over `index`, scoped by the organization policies in `directory`.
    pub fn new(
        index: Arc<dyn ChunkIndex>,
        artifacts: Arc<dyn ArtifactRepository>,
        directory: Arc<dyn OrganizationDirectory>,
        providers: Arc<dyn ProviderResolver>,
        limits: SearchLimits,
    ) -> Self {
        Self {
            retriever: VectorRetriever::new(Arc::clone(&index), Arc::clone(&artifacts)),
            index,
            artifacts,
            directory,
            providers,
            limits,
        }
    }

    /// Run both branches concurrently. A failing branch is logged and counts as empty.
    pub async fn search(
        &self,
        query: &str,
        caller: &CallerIdentity,
        kinds: ArtifactKinds,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        let policy = self.directory.policy(caller.organization_id).await?;
        let filter = ScopeFilter::new(Scope::for_caller(caller, &policy), kinds);

        let vector = async {
            let provider = self.providers.resolve(caller.organization_id).await?;
            self.retriever
                .retrieve(provider.as_ref(), query, filter, self.limits)
                .await
        };
        let lexical = async {
            let hits = self
                .index
                .lexical_search(LexicalQuery {
                    text: query.to_string(),
                    filter,
                    limit: self.limits.top_k.saturating_mul(4),
                })
                .await?;
            let hits: Vec<ChunkHit> = hits.into_iter().map(|lexical| lexical.hit).collect();
            current_hits(self.artifacts.as_ref(), &filter, hits).await
        };
        let (vector, lexical) = tokio::join!(vector, lexical);

        let vector = vector.unwrap_or_else(|error| {
            tracing::warn!(
                organization_id = %caller.organization_id,
                error = %error,
                "Vector branch of hybrid search failed"
            );
            Vec::new()
        });
        let lexical = lexical.unwrap_or_else(|error: RetrievalError| {
            tracing::warn!(
                organization_id = %caller.organization_id,
                error = %error,
                "Lexical branch of hybrid search failed"
            );
            Vec::new()
        });

        Ok(merge_results(vector, lexical, self.limits.top_k))
    }
}
