//! Retrieval, prompting and streaming for one answer.

use super::prompt::{
    HISTORY_TURNS, build_context, compose_prompt, rag_system_prompt, single_scope_system_prompt,
};
use super::{ChatTurn, Citation, RagError, RagRequest};
use crate::catalog::{ArtifactRepository, OrganizationDirectory, UsageEvent, UsageRecorder};
use crate::config::Config;
use crate::index::{ChunkHit, ChunkIndex, Scope, ScopeFilter};
use crate::ingestion::estimate_tokens;
use crate::metrics::ServiceMetrics;
use crate::provider::{ModelProvider, ProviderResolver, TokenSink};
use crate::retrieval::{EXCERPT_CHARS, RetrievalError, SearchLimits, VectorRetriever, excerpt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Retrieval limits per answer flavor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RagSettings {
    /// Organization-wide answers.
    pub rag: SearchLimits,
    /// Single-artifact chat.
    pub chat: SearchLimits,
    /// Earlier turns replayed to the model.
    pub history_turns: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            rag: SearchLimits::new(6, 0.35),
            chat: SearchLimits::new(4, 0.3),
            history_turns: HISTORY_TURNS,
        }
    }
}

impl RagSettings {
    /// Settings from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            rag: SearchLimits::rag(config),
            chat: SearchLimits::chat(config),
            history_turns: HISTORY_TURNS,
        }
    }
}

/// Streams grounded answers.
pub struct RagOrchestrator {
    artifacts: Arc<dyn ArtifactRepository>,
    directory: Arc<dyn OrganizationDirectory>,
    usage: Arc<dyn UsageRecorder>,
    providers: Arc<dyn ProviderResolver>,
    retriever: VectorRetriever,
    metrics: Arc<ServiceMetrics>,
    settings: RagSettings,
}

impl RagOrchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        artifacts: Arc<dyn ArtifactRepository>,
        directory: Arc<dyn OrganizationDirectory>,
        usage: Arc<dyn UsageRecorder>,
        providers: Arc<dyn ProviderResolver>,
        index: Arc<dyn ChunkIndex>,
        metrics: Arc<ServiceMetrics>,
        settings: RagSettings,
    ) -> Self {
        Self {
            retriever: VectorRetriever::new(index, Arc::clone(&artifacts)),
            artifacts,
            directory,
            usage,
            providers,
            metrics,
            settings,
        }
    }

    /// Answer from everything the caller may see.
    ///
    /// Tokens go to `sink` as they arrive. When retrieval fails the answer is generated without
    /// context instead of failing the turn.
    pub async fn answer(
        &self,
        request: &RagRequest,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Citation>, RagError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }
        let organization_id = request.caller.organization_id;
        let provider = self.providers.resolve(organization_id).await?;

        let retrieval = async {
            let policy = self.directory.policy(organization_id).await?;
            let filter = ScopeFilter::new(Scope::for_caller(&request.caller, &policy), request.kinds);
            self.retriever
                .retrieve(provider.as_ref(), question, filter, self.settings.rag)
                .await
        };
        let (hits, degraded) = self.degrade_on_failure(organization_id, retrieval.await);

        let context = build_context(&hits);
        let system_prompt = rag_system_prompt(&context);
        self.stream_answer(
            provider.as_ref(),
            &system_prompt,
            &request.history,
            question,
            sink,
            cancel,
        )
        .await?;

        let citations = self.citations(organization_id, &hits).await;
        self.finish(
            provider.as_ref(),
            organization_id,
            None,
            "rag_query",
            &system_prompt,
            question,
            degraded,
        )
        .await;
        Ok(citations)
    }

    /// Answer about one artifact only.
    pub async fn chat_single_scope(
        &self,
        artifact_id: Uuid,
        question: &str,
        history: &[ChatTurn],
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Citation>, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }
        let artifact = self.artifacts.artifact(artifact_id).await?;
        let organization_id = artifact.organization_id;
        let provider = self.providers.resolve(organization_id).await?;

        let retrieval = self
            .retriever
            .retrieve(
                provider.as_ref(),
                question,
                ScopeFilter::artifact(organization_id, artifact_id),
                self.settings.chat,
            )
            .await;
        let (hits, degraded) = self.degrade_on_failure(organization_id, retrieval);

        let system_prompt = single_scope_system_prompt(&artifact.title, &build_context(&hits));
        self.stream_answer(
            provider.as_ref(),
            &system_prompt,
            history,
            question,
            sink,
            cancel,
        )
        .await?;

        let citations = self.citations(organization_id, &hits).await;
        self.finish(
            provider.as_ref(),
            organization_id,
            Some(artifact_id),
            "artifact_chat",
            &system_prompt,
            question,
            degraded,
        )
        .await;
        Ok(citations)
    }

    fn degrade_on_failure(
        &self,
        organization_id: Uuid,
        retrieval: Result<Vec<ChunkHit>, RetrievalError>,
    ) -> (Vec<ChunkHit>, bool) {
        match retrieval {
            Ok(hits) => (hits, false),
            Err(error) => {
                tracing::warn!(
                    organization_id = %organization_id,
                    error = %error,
                    "Retrieval failed, answering without context"
                );
                (Vec::new(), true)
            }
        }
    }

    async fn stream_answer(
        &self,
        provider: &dyn ModelProvider,
        system_prompt: &str,
        history: &[ChatTurn],
        question: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), RagError> {
        let prompt = compose_prompt(history, question, self.settings.history_turns);
        provider
            .stream_completion(&prompt, system_prompt, sink, cancel)
            .await?;
        Ok(())
    }

    async fn citations(&self, organization_id: Uuid, hits: &[ChunkHit]) -> Vec<Citation> {
        if hits.is_empty() {
            return Vec::new();
        }
        let divisions = match self.directory.division_names(organization_id).await {
            Ok(names) => names,
            Err(error) => {
                tracing::warn!(
                    organization_id = %organization_id,
                    error = %error,
                    "Division names unavailable for citations"
                );
                HashMap::new()
            }
        };
        hits.iter()
            .map(|hit| Citation {
                artifact_id: hit.artifact_id,
                artifact_kind: hit.artifact_kind,
                title: hit.title.clone(),
                locator: hit.locator(),
                division_name: hit
                    .division_id
                    .and_then(|division| divisions.get(&division).cloned()),
                excerpt: excerpt(&hit.content, EXCERPT_CHARS),
                similarity: hit.score,
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        provider: &dyn ModelProvider,
        organization_id: Uuid,
        artifact_id: Option<Uuid>,
        operation: &str,
        system_prompt: &str,
        question: &str,
        degraded: bool,
    ) {
        self.metrics.record_answer(degraded);
        let event = UsageEvent {
            organization_id,
            artifact_id,
            operation: operation.to_string(),
            model: provider.chat_model().to_string(),
            estimated_tokens: (estimate_tokens(system_prompt) + estimate_tokens(question)) as u64,
        };
        if let Err(error) = self.usage.record_usage(event).await {
            tracing::warn!(organization_id = %organization_id, error = %error, "Failed to record usage");
        }
    }
}
