#![allow(dead_code)]

use async_trait::async_trait;
use rustykb::catalog::{
    ArtifactKind, CallerIdentity, NewArtifact, OrganizationPolicy, ProviderSettings, Role,
    SqliteCatalog,
};
use rustykb::index::MemoryChunkIndex;
use rustykb::provider::{
    CompletionOptions, ModelProvider, ProviderError, ProviderResolver, TokenSink,
};
use rustykb::service::{Collaborators, KnowledgeService, ServiceSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DIMENSION: usize = 64;

/// Deterministic embedding: every lowercase word is hashed into one slot, then normalized.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut embedding = vec![0.0_f32; DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
    {
        let slot = word
            .to_lowercase()
            .bytes()
            .fold(17usize, |acc, byte| acc.wrapping_mul(131).wrapping_add(byte as usize));
        embedding[slot % DIMENSION] += 1.0;
    }
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter_mut().for_each(|v| *v /= norm);
    }
    embedding
}

/// Provider double with hash embeddings and a fixed streamed answer.
pub struct FakeProvider {
    answer: Vec<String>,
    fail_embeddings: AtomicBool,
    completions: Mutex<Vec<String>>,
    system_prompts: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(answer: &[&str]) -> Self {
        Self {
            answer: answer.iter().map(|token| token.to_string()).collect(),
            fail_embeddings: AtomicBool::new(false),
            completions: Mutex::new(Vec::new()),
            system_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_embeddings(&self, fail: bool) {
        self.fail_embeddings.store(fail, Ordering::SeqCst);
    }

    /// Completions returned in order, then `{}`.
    pub fn script_completions(&self, completions: &[&str]) {
        let mut queue = self.completions.lock().expect("lock");
        queue.extend(completions.iter().rev().map(|text| text.to_string()));
    }

    pub fn system_prompts(&self) -> Vec<String> {
        self.system_prompts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ModelProvider for FakeProvider {
    fn label(&self) -> &str {
        "fake"
    }

    fn embedding_model(&self) -> &str {
        "fake-embedding"
    }

    fn chat_model(&self) -> &str {
        "fake-chat"
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(ProviderError::Http {
                provider: "fake".into(),
                status: 400,
                body: "model not loaded".into(),
            });
        }
        Ok(hash_embedding(text))
    }

    async fn generate_completion(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        Ok(self
            .completions
            .lock()
            .expect("lock")
            .pop()
            .unwrap_or_else(|| "{}".to_string()))
    }

    async fn stream_completion(
        &self,
        _prompt: &str,
        system_prompt: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.system_prompts
            .lock()
            .expect("lock")
            .push(system_prompt.to_string());
        for token in &self.answer {
            if cancel.is_cancelled() || sink.send(token.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

pub struct FakeResolver(pub Arc<FakeProvider>);

#[async_trait]
impl ProviderResolver for FakeResolver {
    async fn resolve(&self, _organization_id: Uuid) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let provider: Arc<dyn ModelProvider> = self.0.clone();
        Ok(provider)
    }
}

pub const ORG: Uuid = Uuid::from_u128(0xA);
pub const OTHER_ORG: Uuid = Uuid::from_u128(0xB);
pub const SALES: Uuid = Uuid::from_u128(0x51);
pub const LEGAL: Uuid = Uuid::from_u128(0x52);

pub struct Harness {
    pub catalog: Arc<SqliteCatalog>,
    pub index: Arc<MemoryChunkIndex>,
    pub provider: Arc<FakeProvider>,
    pub service: KnowledgeService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(OrganizationPolicy::default())
    }

    pub fn with_policy(policy: OrganizationPolicy) -> Self {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        catalog
            .create_organization(ORG, "Acme", &ProviderSettings::default(), policy)
            .expect("org");
        catalog
            .create_organization(
                OTHER_ORG,
                "Globex",
                &ProviderSettings::default(),
                OrganizationPolicy::default(),
            )
            .expect("other org");
        catalog.create_division(SALES, ORG, "Sales").expect("sales");
        catalog.create_division(LEGAL, ORG, "Legal").expect("legal");

        let index = Arc::new(MemoryChunkIndex::new(DIMENSION));
        let provider = Arc::new(FakeProvider::new(&["Sure", ", here", " you go."]));
        let mut settings = ServiceSettings::default();
        settings.search.min_similarity = 0.2;
        settings.rag.rag.min_similarity = 0.2;
        settings.rag.chat.min_similarity = 0.2;
        let service = KnowledgeService::new(
            Collaborators::from_catalog(catalog.clone()),
            index.clone(),
            Arc::new(FakeResolver(provider.clone())),
            settings,
        );
        Self {
            catalog,
            index,
            provider,
            service,
        }
    }

    /// Create a plain-text artifact and ingest it synchronously.
    pub async fn ingested(
        &self,
        id: u128,
        organization_id: Uuid,
        division_id: Option<Uuid>,
        kind: ArtifactKind,
        title: &str,
        text: &str,
    ) -> Uuid {
        let id = self.create(id, organization_id, division_id, kind, title, text);
        self.service.ingest_now(id).await.expect("ingestion");
        id
    }

    pub fn create(
        &self,
        id: u128,
        organization_id: Uuid,
        division_id: Option<Uuid>,
        kind: ArtifactKind,
        title: &str,
        text: &str,
    ) -> Uuid {
        let id = Uuid::from_u128(id);
        self.catalog
            .create_artifact(&NewArtifact {
                id,
                organization_id,
                division_id,
                kind,
                title: title.to_string(),
                file_name: Some(format!("{}.txt", title.to_lowercase().replace(' ', "_"))),
                media_type: "text/plain".into(),
                summary: None,
                content: text.as_bytes().to_vec(),
            })
            .expect("artifact");
        id
    }
}

pub fn caller(role: Role, division_id: Option<Uuid>) -> CallerIdentity {
    CallerIdentity {
        user_id: Uuid::from_u128(0xF00),
        organization_id: ORG,
        division_id,
        role,
    }
}
