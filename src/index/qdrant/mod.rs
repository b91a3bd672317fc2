//! Qdrant-backed chunk index.

pub mod client;
pub mod filters;
pub mod payload;
pub mod scroller;
pub mod types;

use super::lexical::{best_match, rank_lexical_hits};
use super::{
    ChunkHit, ChunkIndex, ChunkRecord, IndexError, LexicalHit, LexicalQuery, VectorQuery,
};
use async_trait::async_trait;
use futures_util::{pin_mut, stream::StreamExt};
use serde_json::{Value, json};
use uuid::Uuid;

pub use client::QdrantService;
pub use filters::{artifact_filter, build_scope_filter};
pub use types::{QdrantError, ScoredPoint};

const SCROLL_PAGE_SIZE: usize = 128;
/// Points a lexical query reads before it stops scanning.
pub const LEXICAL_SCAN_LIMIT: usize = 10_000;

/// [`ChunkIndex`] storing one point per chunk in a Qdrant collection.
pub struct QdrantChunkIndex {
    service: QdrantService,
    collection: String,
    dimension: usize,
}

impl QdrantChunkIndex {
    /// Wrap a client for `collection` holding `dimension`-sized vectors.
    pub fn new(service: QdrantService, collection: impl Into<String>, dimension: usize) -> Self {
        Self {
            service,
            collection: collection.into(),
            dimension,
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        if actual == self.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            })
        }
    }
}

fn payload_indexes() -> Vec<(&'static str, Value)> {
    vec![
        ("organization_id", json!("keyword")),
        ("division_id", json!("keyword")),
        ("artifact_id", json!("keyword")),
        ("artifact_kind", json!("keyword")),
        ("processed", json!("bool")),
    ]
}

#[async_trait]
impl ChunkIndex for QdrantChunkIndex {
    async fn prepare(&self) -> Result<(), IndexError> {
        self.service
            .create_collection_if_not_exists(&self.collection, self.dimension as u64)
            .await?;
        self.service
            .ensure_payload_indexes(&self.collection, &payload_indexes())
            .await?;
        Ok(())
    }

    async fn delete_artifact(&self, artifact_id: Uuid) -> Result<(), IndexError> {
        self.service
            .delete_points(&self.collection, artifact_filter(artifact_id))
            .await?;
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError> {
        for chunk in &chunks {
            self.check_dimension(chunk.embedding.len())?;
        }
        let points = chunks.iter().map(payload::chunk_point).collect();
        self.service.upsert_points(&self.collection, points).await?;
        Ok(())
    }

    async fn mark_processed(&self, artifact_id: Uuid) -> Result<(), IndexError> {
        self.service
            .set_payload(
                &self.collection,
                json!({ "processed": true }),
                artifact_filter(artifact_id),
            )
            .await?;
        Ok(())
    }

    async fn vector_search(&self, query: VectorQuery) -> Result<Vec<ChunkHit>, IndexError> {
        self.check_dimension(query.embedding.len())?;
        let points = self
            .service
            .search_points(
                &self.collection,
                query.embedding,
                build_scope_filter(&query.filter),
                query.limit,
                query.min_similarity,
            )
            .await?;

        points
            .into_iter()
            .filter_map(|point| point.payload.map(|payload| (payload, point.score)))
            .map(|(payload, score)| payload::hit_from_payload(&payload, score))
            .collect()
    }

    async fn lexical_search(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>, IndexError> {
        let filter = build_scope_filter(&query.filter);
        let stream =
            scroller::stream_payloads(&self.service, &self.collection, filter, SCROLL_PAGE_SIZE);
        pin_mut!(stream);

        let mut hits = Vec::new();
        let mut scanned = 0;
        while let Some(payload) = stream.next().await {
            if scanned == LEXICAL_SCAN_LIMIT {
                tracing::warn!(
                    collection = %self.collection,
                    organization_id = %query.filter.scope.organization_id,
                    limit = LEXICAL_SCAN_LIMIT,
                    "Lexical scan limit reached, remaining chunks skipped"
                );
                break;
            }
            scanned += 1;
            let hit = payload::hit_from_payload(&payload?, 0.0)?;
            if let Some(field) = best_match(
                &query.text,
                &hit.title,
                hit.file_name.as_deref(),
                hit.summary.as_deref(),
                &hit.content,
            ) {
                hits.push(LexicalHit {
                    hit: ChunkHit {
                        score: field.weight(),
                        ..hit
                    },
                    field,
                });
            }
        }
        Ok(rank_lexical_hits(hits, query.limit))
    }

    async fn count_chunks(&self, artifact_id: Uuid) -> Result<usize, IndexError> {
        Ok(self
            .service
            .count_points(&self.collection, artifact_filter(artifact_id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ArtifactKinds, Scope, ScopeFilter};
    use httpmock::{Method::POST, MockServer};

    fn index(server: &MockServer) -> QdrantChunkIndex {
        let service = QdrantService::new(&server.base_url(), None).expect("client");
        QdrantChunkIndex::new(service, "chunks", 2)
    }

    fn stored(title: &str, content: &str) -> Value {
        stored_for(9, title, content)
    }

    fn stored_for(artifact: u128, title: &str, content: &str) -> Value {
        json!({
            "payload": {
                "artifact_id": Uuid::from_u128(artifact).to_string(),
                "artifact_kind": "document",
                "organization_id": Uuid::from_u128(1).to_string(),
                "division_id": null,
                "title": title,
                "file_name": "handbook.pdf",
                "summary": null,
                "chunk_index": 0,
                "content": content,
                "page_start": 2,
                "page_end": 3,
                "processed": true
            }
        })
    }

    #[tokio::test]
    async fn lexical_search_keeps_only_true_substring_matches() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/chunks/points/scroll");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [
                            stored("Policies", "Remote work requires approval."),
                            stored("Policies", "Work is remote-first for some teams.")
                        ],
                        "next_page_offset": null
                    }
                }));
            })
            .await;

        let hits = index(&server)
            .lexical_search(LexicalQuery {
                text: "remote work".into(),
                filter: ScopeFilter::new(Scope::organization(Uuid::from_u128(1)), ArtifactKinds::All),
                limit: 10,
            })
            .await
            .expect("lexical");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field, crate::index::LexicalField::Content);
        assert!((hits[0].hit.score - 0.6).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn lexical_search_matches_inside_words() {
        let server = MockServer::start_async().await;
        let scroll = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/scroll")
                    .body_contains("\"organization_id\"");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [stored("Handbook", "Welcome aboard.")],
                        "next_page_offset": null
                    }
                }));
            })
            .await;

        let hits = index(&server)
            .lexical_search(LexicalQuery {
                text: "book".into(),
                filter: ScopeFilter::new(Scope::organization(Uuid::from_u128(1)), ArtifactKinds::All),
                limit: 10,
            })
            .await
            .expect("lexical");

        scroll.assert();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field, crate::index::LexicalField::Title);
        assert!((hits[0].hit.score - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn lexical_search_reads_every_page_before_ranking() {
        let server = MockServer::start_async().await;
        let first_page: Vec<Value> = (0..3)
            .map(|_| stored_for(1, "Handbook", "Read the expense policy first."))
            .collect();
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/scroll")
                    .body_contains("\"offset\":null");
                then.status(200).json_body(json!({
                    "result": { "points": first_page, "next_page_offset": "next" }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/scroll")
                    .body_contains("\"offset\":\"next\"");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [stored_for(2, "Expense policy", "Claims are monthly.")],
                        "next_page_offset": null
                    }
                }));
            })
            .await;

        let hits = index(&server)
            .lexical_search(LexicalQuery {
                text: "expense policy".into(),
                filter: ScopeFilter::new(Scope::organization(Uuid::from_u128(1)), ArtifactKinds::All),
                limit: 1,
            })
            .await
            .expect("lexical");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hit.artifact_id, Uuid::from_u128(2));
        assert_eq!(hits[0].field, crate::index::LexicalField::Title);
    }

    #[tokio::test]
    async fn vector_search_rejects_mismatched_query_dimension() {
        let server = MockServer::start_async().await;
        let err = index(&server)
            .vector_search(VectorQuery {
                embedding: vec![1.0, 0.0, 0.0],
                filter: ScopeFilter::new(Scope::organization(Uuid::nil()), ArtifactKinds::All),
                limit: 4,
                min_similarity: 0.3,
            })
            .await
            .expect_err("dimension");
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn mark_processed_flips_the_flag_for_the_artifact() {
        let server = MockServer::start_async().await;
        let artifact = Uuid::from_u128(9);
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/payload")
                    .body_contains("\"processed\":true")
                    .body_contains(&artifact.to_string());
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        index(&server).mark_processed(artifact).await.expect("mark");
        mock.assert();
    }
}
