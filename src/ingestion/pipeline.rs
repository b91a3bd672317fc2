//! The ingestion state machine for one artifact.

use super::chunking::{TextChunk, chunk_pages};
use super::extract::extract_text;
use super::graph::{GraphSummary, extract_knowledge_graph};
use super::progress::{ProgressTracker, embedding_progress, should_log_completion};
use super::IngestionError;
use crate::catalog::{ArtifactKind, ArtifactRecord, ArtifactRepository, UsageEvent, UsageRecorder};
use crate::config::Config;
use crate::index::{ChunkIndex, ChunkRecord};
use crate::metrics::ServiceMetrics;
use crate::provider::{ModelProvider, ProviderResolver};
use futures_util::{StreamExt, pin_mut, stream};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Tunables for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionSettings {
    /// Upper bound of tokens per chunk.
    pub max_tokens: usize,
    /// Tokens repeated at the start of the next chunk.
    pub overlap_tokens: usize,
    /// Embedding requests in flight at once.
    pub embedding_concurrency: usize,
    /// Every how many embedded chunks a progress entry is written.
    pub log_every: usize,
    /// Characters of article text sent to knowledge graph extraction.
    pub graph_text_limit: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
            embedding_concurrency: 4,
            log_every: 10,
            graph_text_limit: 12_000,
        }
    }
}

impl IngestionSettings {
    /// Settings from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.chunk_max_tokens,
            overlap_tokens: config.chunk_overlap_tokens,
            embedding_concurrency: config.embedding_concurrency.max(1),
            ..Self::default()
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionOutcome {
    /// Processed artifact.
    pub artifact_id: Uuid,
    /// Chunks written to the index.
    pub chunk_count: usize,
    /// Embedding model that produced the vectors.
    pub embedding_model: String,
    /// Version recorded by the completed run.
    pub embedding_version: i64,
    /// Usage estimate: chunk tokens times two.
    pub estimated_tokens: u64,
    /// Knowledge graph counts, articles only.
    pub graph: Option<GraphSummary>,
    /// Whether extraction produced a placeholder instead of file content.
    pub placeholder_text: bool,
}

/// Runs extraction, chunking, embedding and persistence for one artifact.
pub struct IngestionPipeline {
    artifacts: Arc<dyn ArtifactRepository>,
    usage: Arc<dyn UsageRecorder>,
    index: Arc<dyn ChunkIndex>,
    providers: Arc<dyn ProviderResolver>,
    metrics: Arc<ServiceMetrics>,
    settings: IngestionSettings,
}

impl IngestionPipeline {
    /// Pipeline over the given collaborators.
    pub fn new(
        artifacts: Arc<dyn ArtifactRepository>,
        usage: Arc<dyn UsageRecorder>,
        index: Arc<dyn ChunkIndex>,
        providers: Arc<dyn ProviderResolver>,
        metrics: Arc<ServiceMetrics>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            artifacts,
            usage,
            index,
            providers,
            metrics,
            settings,
        }
    }

    /// Process an artifact from scratch, replacing any chunks of a previous run.
    ///
    /// On failure the artifact is left `failed` with the error message recorded verbatim.
    pub async fn run(&self, artifact_id: Uuid) -> Result<IngestionOutcome, IngestionError> {
        let artifact = self.artifacts.artifact(artifact_id).await?;
        self.artifacts.begin_processing(artifact_id).await?;
        let progress = ProgressTracker::new(Arc::clone(&self.artifacts), artifact_id);

        match self.process(&artifact, &progress).await {
            Ok(outcome) => {
                self.metrics.record_ingestion(outcome.chunk_count as u64);
                tracing::info!(
                    artifact_id = %artifact_id,
                    chunks = outcome.chunk_count,
                    version = outcome.embedding_version,
                    model = %outcome.embedding_model,
                    "Ingestion completed"
                );
                Ok(outcome)
            }
            Err(error) => {
                let message = error.to_string();
                tracing::error!(artifact_id = %artifact_id, error = %message, "Ingestion failed");
                self.metrics.record_ingestion_failure();
                progress
                    .log_best_effort(format!("Processing failed: {message}"), progress.last())
                    .await;
                if let Err(fail_error) = self.artifacts.fail_processing(artifact_id, &message).await
                {
                    tracing::error!(
                        artifact_id = %artifact_id,
                        error = %fail_error,
                        "Could not record ingestion failure"
                    );
                }
                Err(error)
            }
        }
    }

    async fn process(
        &self,
        artifact: &ArtifactRecord,
        progress: &ProgressTracker,
    ) -> Result<IngestionOutcome, IngestionError> {
        progress.log("Processing started", 5).await?;

        let source = self.artifacts.load_source(artifact.id).await?;
        let extracted = extract_text(&source).await;
        let extract_message = if extracted.placeholder {
            "No readable text found, indexed a file description instead".to_string()
        } else {
            format!("Extracted text from {} page(s)", extracted.page_count)
        };
        progress.log(extract_message, 15).await?;

        let provider = self.providers.resolve(artifact.organization_id).await?;
        let mut embedding_model = provider.embedding_model().to_string();
        self.artifacts
            .record_embedding_model(artifact.id, &embedding_model)
            .await?;

        let chunks = chunk_pages(
            &extracted.pages,
            self.settings.max_tokens,
            self.settings.overlap_tokens,
        );
        progress
            .log(format!("Split text into {} chunk(s)", chunks.len()), 40)
            .await?;

        self.index.delete_artifact(artifact.id).await?;
        let version = artifact.embedding_version + 1;
        self.embed_chunks(artifact, &chunks, version, provider.as_ref(), progress)
            .await?;

        // The provider may have switched to the managed embedder mid-run.
        if provider.embedding_model() != embedding_model {
            embedding_model = provider.embedding_model().to_string();
            self.artifacts
                .record_embedding_model(artifact.id, &embedding_model)
                .await?;
        }

        let graph = match artifact.kind {
            ArtifactKind::Article => {
                self.extract_graph(artifact, &extracted.full_text, provider.as_ref(), progress)
                    .await
            }
            ArtifactKind::Document => None,
        };

        self.index.mark_processed(artifact.id).await?;
        let embedding_version = self.artifacts.complete_processing(artifact.id).await?;
        progress.log_best_effort("Processing complete", 100).await;

        let estimated_tokens = chunks
            .iter()
            .map(|chunk| chunk.token_count as u64)
            .sum::<u64>()
            * 2;
        self.record_usage(artifact, &embedding_model, estimated_tokens)
            .await;

        Ok(IngestionOutcome {
            artifact_id: artifact.id,
            chunk_count: chunks.len(),
            embedding_model,
            embedding_version,
            estimated_tokens,
            graph,
            placeholder_text: extracted.placeholder,
        })
    }

    async fn embed_chunks(
        &self,
        artifact: &ArtifactRecord,
        chunks: &[TextChunk],
        embedding_version: i64,
        provider: &dyn ModelProvider,
        progress: &ProgressTracker,
    ) -> Result<(), IngestionError> {
        let total = chunks.len();
        let pending: Vec<_> = chunks
            .iter()
            .map(|chunk| embed_chunk(provider, artifact, chunk, embedding_version))
            .collect();
        let records =
            stream::iter(pending).buffer_unordered(self.settings.embedding_concurrency.max(1));
        pin_mut!(records);

        let mut done = 0;
        while let Some(record) = records.next().await {
            self.index.upsert_chunks(vec![record?]).await?;
            done += 1;
            if should_log_completion(done, total, self.settings.log_every) {
                progress
                    .log(
                        format!("Embedded chunk {done} of {total}"),
                        embedding_progress(done, total),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn extract_graph(
        &self,
        artifact: &ArtifactRecord,
        text: &str,
        provider: &dyn ModelProvider,
        progress: &ProgressTracker,
    ) -> Option<GraphSummary> {
        progress
            .log_best_effort("Extracting knowledge graph", 85)
            .await;
        match extract_knowledge_graph(
            provider,
            self.artifacts.as_ref(),
            artifact.id,
            &artifact.title,
            text,
            self.settings.graph_text_limit,
        )
        .await
        {
            Ok(summary) => {
                progress
                    .log_best_effort(
                        format!(
                            "Knowledge graph: {} entities, {} relationships",
                            summary.entities, summary.relationships
                        ),
                        90,
                    )
                    .await;
                Some(summary)
            }
            Err(error) => {
                tracing::warn!(
                    artifact_id = %artifact.id,
                    error = %error,
                    "Knowledge graph extraction failed, continuing"
                );
                progress
                    .log_best_effort("Knowledge graph extraction skipped", 90)
                    .await;
                None
            }
        }
    }

    async fn record_usage(&self, artifact: &ArtifactRecord, model: &str, estimated_tokens: u64) {
        let event = UsageEvent {
            organization_id: artifact.organization_id,
            artifact_id: Some(artifact.id),
            operation: "ingestion".into(),
            model: model.to_string(),
            estimated_tokens,
        };
        if let Err(error) = self.usage.record_usage(event).await {
            tracing::warn!(artifact_id = %artifact.id, error = %error, "Failed to record usage");
        }
    }
}

async fn embed_chunk(
    provider: &dyn ModelProvider,
    artifact: &ArtifactRecord,
    chunk: &TextChunk,
    embedding_version: i64,
) -> Result<ChunkRecord, IngestionError> {
    let embedding = provider.generate_embedding(&chunk.content).await?;
    Ok(chunk_record(artifact, chunk, embedding_version, embedding))
}

fn chunk_record(
    artifact: &ArtifactRecord,
    chunk: &TextChunk,
    embedding_version: i64,
    embedding: Vec<f32>,
) -> ChunkRecord {
    ChunkRecord {
        artifact_id: artifact.id,
        artifact_kind: artifact.kind,
        organization_id: artifact.organization_id,
        division_id: artifact.division_id,
        title: artifact.title.clone(),
        file_name: artifact.file_name.clone(),
        summary: artifact.summary.clone(),
        chunk_index: chunk.index,
        content: chunk.content.clone(),
        token_count: chunk.token_count,
        page_start: chunk.page_start,
        page_end: chunk.page_end,
        embedding_version,
        embedding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        ArtifactSource, ArtifactStatus, CatalogError, KnowledgeEntity, NewArtifact,
        OrganizationPolicy, ProcessingStatus, ProgressEntry, ProviderSettings,
        ResolvedRelationship, SqliteCatalog,
    };
    use std::collections::HashMap;
    use crate::index::MemoryChunkIndex;
    use crate::testing::{ScriptedProvider, StaticResolver};

    const ORG: Uuid = Uuid::from_u128(1);

    struct Harness {
        catalog: Arc<SqliteCatalog>,
        index: Arc<MemoryChunkIndex>,
        provider: Arc<ScriptedProvider>,
        pipeline: IngestionPipeline,
    }

    fn harness() -> Harness {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        catalog
            .create_organization(
                ORG,
                "Acme",
                &ProviderSettings::default(),
                OrganizationPolicy::default(),
            )
            .expect("org");
        let index = Arc::new(MemoryChunkIndex::new(16));
        let provider = Arc::new(ScriptedProvider::new(16));
        let pipeline = IngestionPipeline::new(
            catalog.clone(),
            catalog.clone(),
            index.clone(),
            Arc::new(StaticResolver::new(provider.clone())),
            Arc::new(ServiceMetrics::new()),
            IngestionSettings::default(),
        );
        Harness {
            catalog,
            index,
            provider,
            pipeline,
        }
    }

    fn artifact(id: u128, kind: ArtifactKind, content: &str) -> NewArtifact {
        NewArtifact {
            id: Uuid::from_u128(id),
            organization_id: ORG,
            division_id: None,
            kind,
            title: "Remote work policy".into(),
            file_name: Some("remote.txt".into()),
            media_type: "text/plain".into(),
            summary: None,
            content: content.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn progress_log_walks_through_every_stage() {
        let harness = harness();
        let id = Uuid::from_u128(10);
        harness
            .catalog
            .create_artifact(&artifact(
                10,
                ArtifactKind::Document,
                "Employees may work remotely two days a week.\n\nRequests go through the team lead.",
            ))
            .expect("artifact");

        let outcome = harness.pipeline.run(id).await.expect("run");

        assert_eq!(outcome.chunk_count, 1);
        assert_eq!(outcome.embedding_version, 1);
        assert_eq!(outcome.graph, None);
        let status = harness.catalog.status(id).await.expect("status");
        assert_eq!(status.status, ProcessingStatus::Completed);
        assert!(status.processed);
        let progress: Vec<u8> = status.progress_log.iter().map(|entry| entry.progress).collect();
        assert_eq!(progress, vec![5, 15, 40, 80, 100]);
        assert_eq!(harness.index.count_chunks(id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn embedding_failure_marks_the_artifact_failed_verbatim() {
        let harness = harness();
        let id = Uuid::from_u128(11);
        harness
            .catalog
            .create_artifact(&artifact(
                11,
                ArtifactKind::Document,
                "A paragraph that is certainly long enough to be kept.",
            ))
            .expect("artifact");
        harness.provider.fail_embeddings("invalid api key");

        let error = harness.pipeline.run(id).await.expect_err("fails");

        let record = harness.catalog.artifact(id).await.expect("record");
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(!record.processed);
        assert_eq!(record.error.as_deref(), Some(error.to_string().as_str()));
        let status = harness.catalog.status(id).await.expect("status");
        let last = status.progress_log.last().expect("entry");
        assert!(last.message.starts_with("Processing failed: "));
        assert_eq!(last.progress, 40);
    }

    #[tokio::test]
    async fn malformed_graph_output_does_not_fail_articles() {
        let harness = harness();
        let id = Uuid::from_u128(12);
        harness
            .catalog
            .create_artifact(&artifact(
                12,
                ArtifactKind::Article,
                "Acme opened an office in Berlin this spring.",
            ))
            .expect("artifact");
        harness.provider.push_completion(Ok("not json at all".into()));

        let outcome = harness.pipeline.run(id).await.expect("run");

        assert_eq!(outcome.graph, None);
        let status = harness.catalog.status(id).await.expect("status");
        assert_eq!(status.status, ProcessingStatus::Completed);
        assert!(
            status
                .progress_log
                .iter()
                .any(|entry| entry.message == "Knowledge graph extraction skipped")
        );
    }

    /// Catalog wrapper noting the artifact's status as each progress entry is written.
    struct StatusAtProgress {
        inner: Arc<SqliteCatalog>,
        seen: std::sync::Mutex<Vec<(String, ProcessingStatus)>>,
    }

    #[async_trait::async_trait]
    impl ArtifactRepository for StatusAtProgress {
        async fn artifact(&self, id: Uuid) -> Result<ArtifactRecord, CatalogError> {
            self.inner.artifact(id).await
        }

        async fn artifacts(&self, ids: &[Uuid]) -> Result<Vec<ArtifactRecord>, CatalogError> {
            self.inner.artifacts(ids).await
        }

        async fn load_source(&self, id: Uuid) -> Result<ArtifactSource, CatalogError> {
            self.inner.load_source(id).await
        }

        async fn status(&self, id: Uuid) -> Result<ArtifactStatus, CatalogError> {
            self.inner.status(id).await
        }

        async fn begin_processing(&self, id: Uuid) -> Result<(), CatalogError> {
            self.inner.begin_processing(id).await
        }

        async fn append_progress(
            &self,
            id: Uuid,
            entry: &ProgressEntry,
        ) -> Result<(), CatalogError> {
            let status = self.inner.artifact(id).await?.status;
            self.seen
                .lock()
                .expect("lock")
                .push((entry.message.clone(), status));
            self.inner.append_progress(id, entry).await
        }

        async fn record_embedding_model(&self, id: Uuid, model: &str) -> Result<(), CatalogError> {
            self.inner.record_embedding_model(id, model).await
        }

        async fn complete_processing(&self, id: Uuid) -> Result<i64, CatalogError> {
            self.inner.complete_processing(id).await
        }

        async fn fail_processing(&self, id: Uuid, message: &str) -> Result<(), CatalogError> {
            self.inner.fail_processing(id, message).await
        }

        async fn artifacts_in_status(
            &self,
            status: ProcessingStatus,
        ) -> Result<Vec<Uuid>, CatalogError> {
            self.inner.artifacts_in_status(status).await
        }

        async fn replace_entities(
            &self,
            artifact_id: Uuid,
            entities: &[KnowledgeEntity],
        ) -> Result<HashMap<String, Uuid>, CatalogError> {
            self.inner.replace_entities(artifact_id, entities).await
        }

        async fn insert_relationships(
            &self,
            artifact_id: Uuid,
            relationships: &[ResolvedRelationship],
        ) -> Result<(), CatalogError> {
            self.inner
                .insert_relationships(artifact_id, relationships)
                .await
        }
    }

    #[tokio::test]
    async fn completion_is_recorded_before_it_is_announced() {
        let harness = harness();
        let id = Uuid::from_u128(13);
        harness
            .catalog
            .create_artifact(&artifact(
                13,
                ArtifactKind::Document,
                "Remote days are Tuesday and Friday.",
            ))
            .expect("artifact");
        let artifacts = Arc::new(StatusAtProgress {
            inner: harness.catalog.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let pipeline = IngestionPipeline::new(
            artifacts.clone(),
            harness.catalog.clone(),
            harness.index.clone(),
            Arc::new(StaticResolver::new(harness.provider.clone())),
            Arc::new(ServiceMetrics::new()),
            IngestionSettings::default(),
        );

        pipeline.run(id).await.expect("run");

        let seen = artifacts.seen.lock().expect("lock").clone();
        let (message, status) = seen.last().expect("entries");
        assert_eq!(message, "Processing complete");
        assert_eq!(*status, ProcessingStatus::Completed);
        assert!(
            seen[..seen.len() - 1]
                .iter()
                .all(|(_, status)| *status == ProcessingStatus::Processing)
        );
    }
}
