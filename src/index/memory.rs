//! Process-local chunk index.
//!
//! Brute-force cosine search over every visible chunk. Used by tests and single-node setups that
//! run without Qdrant (`CHUNK_STORE=memory`).

use super::lexical::{best_match, rank_lexical_hits};
use super::{
    ChunkHit, ChunkIndex, ChunkRecord, IndexError, LexicalHit, LexicalQuery, VectorQuery,
};
use async_trait::async_trait;
use std::cmp::Ordering;
use tokio::sync::RwLock;
use uuid::Uuid;

struct StoredChunk {
    record: ChunkRecord,
    processed: bool,
}

/// In-memory [`ChunkIndex`].
pub struct MemoryChunkIndex {
    dimension: usize,
    chunks: RwLock<Vec<StoredChunk>>,
}

impl MemoryChunkIndex {
    /// Create an empty index accepting vectors of `dimension` elements.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Ordinals of the stored chunks of an artifact, sorted.
    pub async fn chunk_indexes(&self, artifact_id: Uuid) -> Vec<usize> {
        let chunks = self.chunks.read().await;
        let mut indexes: Vec<usize> = chunks
            .iter()
            .filter(|stored| stored.record.artifact_id == artifact_id)
            .map(|stored| stored.record.chunk_index)
            .collect();
        indexes.sort_unstable();
        indexes
    }
}

fn to_hit(record: &ChunkRecord, score: f32) -> ChunkHit {
    ChunkHit {
        artifact_id: record.artifact_id,
        artifact_kind: record.artifact_kind,
        division_id: record.division_id,
        title: record.title.clone(),
        file_name: record.file_name.clone(),
        summary: record.summary.clone(),
        chunk_index: record.chunk_index,
        content: record.content.clone(),
        page_start: record.page_start,
        page_end: record.page_end,
        score,
    }
}

fn visible(stored: &StoredChunk, query_filter: &super::ScopeFilter) -> bool {
    let record = &stored.record;
    query_filter.admits(
        record.organization_id,
        record.division_id,
        record.artifact_kind,
        record.artifact_id,
        stored.processed,
    )
}

/// Cosine similarity, 0 when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl ChunkIndex for MemoryChunkIndex {
    async fn prepare(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn delete_artifact(&self, artifact_id: Uuid) -> Result<(), IndexError> {
        self.chunks
            .write()
            .await
            .retain(|stored| stored.record.artifact_id != artifact_id);
        Ok(())
    }

    async fn upsert_chunks(&self, records: Vec<ChunkRecord>) -> Result<(), IndexError> {
        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != self.dimension)
        {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.embedding.len(),
            });
        }

        let mut chunks = self.chunks.write().await;
        for record in records {
            chunks.retain(|stored| {
                !(stored.record.artifact_id == record.artifact_id
                    && stored.record.embedding_version == record.embedding_version
                    && stored.record.chunk_index == record.chunk_index)
            });
            chunks.push(StoredChunk {
                record,
                processed: false,
            });
        }
        Ok(())
    }

    async fn mark_processed(&self, artifact_id: Uuid) -> Result<(), IndexError> {
        let mut chunks = self.chunks.write().await;
        for stored in chunks
            .iter_mut()
            .filter(|stored| stored.record.artifact_id == artifact_id)
        {
            stored.processed = true;
        }
        Ok(())
    }

    async fn vector_search(&self, query: VectorQuery) -> Result<Vec<ChunkHit>, IndexError> {
        if query.embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.embedding.len(),
            });
        }

        let chunks = self.chunks.read().await;
        let mut hits: Vec<ChunkHit> = chunks
            .iter()
            .filter(|stored| visible(stored, &query.filter))
            .filter_map(|stored| {
                let score = cosine_similarity(&query.embedding, &stored.record.embedding);
                (score >= query.min_similarity).then(|| to_hit(&stored.record, score))
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn lexical_search(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>, IndexError> {
        let chunks = self.chunks.read().await;
        let hits: Vec<LexicalHit> = chunks
            .iter()
            .filter(|stored| visible(stored, &query.filter))
            .filter_map(|stored| {
                let record = &stored.record;
                best_match(
                    &query.text,
                    &record.title,
                    record.file_name.as_deref(),
                    record.summary.as_deref(),
                    &record.content,
                )
                .map(|field| LexicalHit {
                    hit: to_hit(record, field.weight()),
                    field,
                })
            })
            .collect();
        Ok(rank_lexical_hits(hits, query.limit))
    }

    async fn count_chunks(&self, artifact_id: Uuid) -> Result<usize, IndexError> {
        let chunks = self.chunks.read().await;
        Ok(chunks
            .iter()
            .filter(|stored| stored.record.artifact_id == artifact_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ArtifactKind;
    use crate::index::{ArtifactKinds, Scope, ScopeFilter, Visibility};

    fn record(artifact: Uuid, division: Option<Uuid>, index: usize, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            artifact_id: artifact,
            artifact_kind: ArtifactKind::Document,
            organization_id: Uuid::from_u128(1),
            division_id: division,
            title: "Travel policy".into(),
            file_name: Some("travel.pdf".into()),
            summary: None,
            chunk_index: index,
            content: format!("chunk {index} about per diem"),
            token_count: 5,
            page_start: 1,
            page_end: 1,
            embedding_version: 1,
            embedding,
        }
    }

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let similarity = cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]);
        assert!((similarity - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn chunks_are_hidden_until_marked_processed() {
        let index = MemoryChunkIndex::new(2);
        let artifact = Uuid::new_v4();
        index
            .upsert_chunks(vec![record(artifact, None, 0, vec![1.0, 0.0])])
            .await
            .expect("upsert");

        let query = VectorQuery {
            embedding: vec![1.0, 0.0],
            filter: ScopeFilter::new(Scope::organization(Uuid::from_u128(1)), ArtifactKinds::All),
            limit: 5,
            min_similarity: 0.1,
        };
        assert!(index.vector_search(query.clone()).await.expect("search").is_empty());

        index.mark_processed(artifact).await.expect("mark");
        let hits = index.vector_search(query).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn division_scope_excludes_other_divisions() {
        let index = MemoryChunkIndex::new(2);
        let mine = Uuid::from_u128(10);
        let theirs = Uuid::from_u128(11);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        index
            .upsert_chunks(vec![
                record(a, Some(mine), 0, vec![1.0, 0.0]),
                record(b, Some(theirs), 0, vec![1.0, 0.0]),
                record(c, None, 0, vec![1.0, 0.0]),
            ])
            .await
            .expect("upsert");
        for artifact in [a, b, c] {
            index.mark_processed(artifact).await.expect("mark");
        }

        let filter = ScopeFilter::new(
            Scope {
                organization_id: Uuid::from_u128(1),
                visibility: Visibility::Division(Some(mine)),
            },
            ArtifactKinds::All,
        );
        let lexical = index
            .lexical_search(LexicalQuery {
                text: "PER DIEM".into(),
                filter,
                limit: 10,
            })
            .await
            .expect("lexical");
        let mut seen: Vec<Uuid> = lexical.iter().map(|hit| hit.hit.artifact_id).collect();
        seen.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn rejects_vectors_of_the_wrong_dimension() {
        let index = MemoryChunkIndex::new(3);
        let err = index
            .upsert_chunks(vec![record(Uuid::new_v4(), None, 0, vec![1.0])])
            .await
            .expect_err("dimension");
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, actual: 1 }));
    }

    #[tokio::test]
    async fn lexical_limit_applies_after_ranking() {
        let index = MemoryChunkIndex::new(2);
        let handbook = Uuid::from_u128(1);
        let policy = Uuid::from_u128(2);
        let mut records: Vec<ChunkRecord> = (0..10)
            .map(|chunk| ChunkRecord {
                title: "Handbook".into(),
                file_name: None,
                content: format!("Section {chunk} of the expense policy."),
                ..record(handbook, None, chunk, vec![1.0, 0.0])
            })
            .collect();
        records.push(ChunkRecord {
            title: "Expense policy".into(),
            file_name: None,
            content: "Submit claims monthly.".into(),
            ..record(policy, None, 0, vec![0.0, 1.0])
        });
        index.upsert_chunks(records).await.expect("upsert");
        index.mark_processed(handbook).await.expect("mark");
        index.mark_processed(policy).await.expect("mark");

        let hits = index
            .lexical_search(LexicalQuery {
                text: "expense policy".into(),
                filter: ScopeFilter::new(Scope::organization(Uuid::from_u128(1)), ArtifactKinds::All),
                limit: 2,
            })
            .await
            .expect("lexical");

        let ranked: Vec<(Uuid, f32)> = hits
            .iter()
            .map(|hit| (hit.hit.artifact_id, hit.hit.score))
            .collect();
        assert_eq!(ranked, vec![(policy, 0.9), (handbook, 0.6)]);
    }
}
