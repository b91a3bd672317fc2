//! Per-call provider resolution from organization settings.

use super::anthropic::{ANTHROPIC_BASE_URL, AnthropicClient};
use super::openai::{OpenAiCompatible, OpenAiSettings};
use super::{CompletionOptions, ModelProvider, ProviderError, RetryPolicy, TokenSink, with_retry};
use crate::catalog::{CredentialVault, OrganizationDirectory, ProviderMode, ProviderSettings};
use crate::config::Config;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_CHAT_MODEL: &str = "gpt-4o-mini";
const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const GEMINI_CHAT_MODEL: &str = "gemini-1.5-flash";
const GEMINI_EMBEDDING_MODEL: &str = "text-embedding-004";
const ANTHROPIC_CHAT_MODEL: &str = "claude-3-5-haiku-latest";

/// Vendor implied by the shape of a bring-your-own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// `sk-ant-` keys.
    Anthropic,
    /// `AIza` keys.
    Gemini,
    /// Everything else.
    OpenAi,
}

/// Classify a key by its prefix. Unknown shapes are treated as OpenAI keys.
pub fn detect_key_shape(key: &str) -> KeyShape {
    let key = key.trim();
    if key.starts_with("sk-ant-") {
        KeyShape::Anthropic
    } else if key.starts_with("AIza") {
        KeyShape::Gemini
    } else {
        KeyShape::OpenAi
    }
}

/// Operator-level settings for the managed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProviderSettings {
    /// OpenAI-compatible endpoint of the managed backend.
    pub base_url: String,
    /// Operator credential.
    pub api_key: Option<String>,
    /// Chat model served to every managed organization.
    pub chat_model: String,
    /// Embedding model, also the fallback embedder.
    pub embedding_model: String,
    /// Vector size of the embedding model.
    pub embedding_dimension: usize,
}

impl ManagedProviderSettings {
    /// Read the managed provider section of the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.managed_base_url.clone(),
            api_key: config.managed_api_key.clone(),
            chat_model: config.managed_chat_model.clone(),
            embedding_model: config.managed_embedding_model.clone(),
            embedding_dimension: config.embedding_dimension,
        }
    }

    fn openai_settings(&self) -> OpenAiSettings {
        OpenAiSettings {
            label: ProviderMode::Managed.as_str().to_string(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            chat_model: self.chat_model.clone(),
            embedding_model: self.embedding_model.clone(),
            dimensions: Some(self.embedding_dimension),
        }
    }
}

enum Backend {
    OpenAi(OpenAiCompatible),
    Anthropic(AnthropicClient),
}

/// A resolved provider with rate-limit retries and the managed embedding fallback applied.
pub struct ConfiguredProvider {
    mode: ProviderMode,
    label: String,
    backend: Backend,
    embedding_fallback: Option<OpenAiCompatible>,
    fallback_active: AtomicBool,
    retry: RetryPolicy,
}

impl ConfiguredProvider {
    fn new(
        mode: ProviderMode,
        backend: Backend,
        embedding_fallback: Option<OpenAiCompatible>,
        retry: RetryPolicy,
    ) -> Self {
        let label = match &backend {
            Backend::OpenAi(client) => client.label().to_string(),
            Backend::Anthropic(_) => "anthropic".to_string(),
        };
        // Anthropic cannot embed at all, so start on the fallback.
        let fallback_active = matches!(backend, Backend::Anthropic(_));
        Self {
            mode,
            label,
            backend,
            embedding_fallback,
            fallback_active: AtomicBool::new(fallback_active),
            retry,
        }
    }

    /// Mode the provider was resolved from.
    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    fn start_on_fallback(self) -> Self {
        self.fallback_active.store(true, Ordering::Relaxed);
        self
    }

    async fn embed_with_fallback(
        &self,
        fallback: &OpenAiCompatible,
        text: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        with_retry(&self.retry, "embedding", move || fallback.embed(text)).await
    }
}

#[async_trait]
impl ModelProvider for ConfiguredProvider {
    fn label(&self) -> &str {
        &self.label
    }

    fn embedding_model(&self) -> &str {
        if self.fallback_active.load(Ordering::Relaxed)
            && let Some(fallback) = &self.embedding_fallback
        {
            return fallback.embedding_model();
        }
        match &self.backend {
            Backend::OpenAi(client) => client.embedding_model(),
            Backend::Anthropic(_) => "unavailable",
        }
    }

    fn chat_model(&self) -> &str {
        match &self.backend {
            Backend::OpenAi(client) => client.chat_model(),
            Backend::Anthropic(client) => client.chat_model(),
        }
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if self.fallback_active.load(Ordering::Relaxed)
            && let Some(fallback) = &self.embedding_fallback
        {
            return self.embed_with_fallback(fallback, text).await;
        }

        let primary = match &self.backend {
            Backend::OpenAi(client) => {
                with_retry(&self.retry, "embedding", move || client.embed(text)).await
            }
            Backend::Anthropic(client) => Err(client.embed()),
        };

        match (primary, &self.embedding_fallback) {
            (Err(error), Some(fallback)) if error.is_embedding_unsupported() => {
                if !self.fallback_active.swap(true, Ordering::Relaxed) {
                    tracing::info!(
                        provider = %self.label,
                        fallback_model = fallback.embedding_model(),
                        error = %error,
                        "Provider cannot embed, using the managed embedding model"
                    );
                }
                self.embed_with_fallback(fallback, text).await
            }
            (result, _) => result,
        }
    }

    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let backend = &self.backend;
        with_retry(&self.retry, "completion", move || async move {
            match backend {
                Backend::OpenAi(client) => client.complete(prompt, options).await,
                Backend::Anthropic(client) => client.complete(prompt, options).await,
            }
        })
        .await
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        system_prompt: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        // Only opening the stream is retried.
        match &self.backend {
            Backend::OpenAi(client) => {
                let response = with_retry(&self.retry, "stream", move || {
                    client.open_stream(prompt, system_prompt)
                })
                .await?;
                client.pump_stream(response, sink, cancel).await
            }
            Backend::Anthropic(client) => {
                let response = with_retry(&self.retry, "stream", move || {
                    client.open_stream(prompt, system_prompt)
                })
                .await?;
                client.pump_stream(response, sink, cancel).await
            }
        }
    }
}

/// Produces the provider an organization is configured to use right now.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    /// Resolve the provider for one operation.
    async fn resolve(
        &self,
        organization_id: Uuid,
    ) -> Result<Arc<dyn ModelProvider>, ProviderError>;
}

/// Resolver reading provider settings from the organization directory on every call, so
/// configuration changes apply to the next operation without a restart.
pub struct DirectoryProviderResolver {
    directory: Arc<dyn OrganizationDirectory>,
    vault: Arc<dyn CredentialVault>,
    managed: ManagedProviderSettings,
    retry: RetryPolicy,
    http: Client,
}

impl DirectoryProviderResolver {
    /// Build a resolver sharing one HTTP client across providers.
    pub fn new(
        directory: Arc<dyn OrganizationDirectory>,
        vault: Arc<dyn CredentialVault>,
        managed: ManagedProviderSettings,
        retry: RetryPolicy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().user_agent("rustykb/0.1").build()?;
        Ok(Self {
            directory,
            vault,
            managed,
            retry,
            http,
        })
    }

    /// Build the provider described by `settings`, with `credential` already revealed.
    pub fn build(
        &self,
        settings: &ProviderSettings,
        credential: Option<String>,
    ) -> Result<ConfiguredProvider, ProviderError> {
        let managed = || OpenAiCompatible::new(self.http.clone(), self.managed.openai_settings());

        match settings.mode {
            ProviderMode::Managed => Ok(ConfiguredProvider::new(
                ProviderMode::Managed,
                Backend::OpenAi(managed()),
                None,
                self.retry,
            )),
            ProviderMode::ByoKey => {
                let key = credential.ok_or_else(|| {
                    ProviderError::Configuration("byo_key mode has no stored API key".into())
                })?;
                let backend = self.byo_backend(settings, key);
                Ok(ConfiguredProvider::new(
                    ProviderMode::ByoKey,
                    backend,
                    Some(managed()),
                    self.retry,
                ))
            }
            ProviderMode::SelfHosted => {
                let endpoint = settings.endpoint.clone().ok_or_else(|| {
                    ProviderError::Configuration("self_hosted mode has no endpoint".into())
                })?;
                let chat_model = settings.chat_model.clone().ok_or_else(|| {
                    ProviderError::Configuration("self_hosted mode has no chat model".into())
                })?;
                let client = OpenAiCompatible::new(
                    self.http.clone(),
                    OpenAiSettings {
                        label: ProviderMode::SelfHosted.as_str().to_string(),
                        base_url: endpoint,
                        api_key: credential,
                        chat_model,
                        embedding_model: settings.embedding_model.clone().unwrap_or_default(),
                        dimensions: None,
                    },
                );
                let provider = ConfiguredProvider::new(
                    ProviderMode::SelfHosted,
                    Backend::OpenAi(client),
                    Some(managed()),
                    self.retry,
                );
                Ok(if settings.embedding_model.is_none() {
                    provider.start_on_fallback()
                } else {
                    provider
                })
            }
        }
    }

    fn byo_backend(&self, settings: &ProviderSettings, key: String) -> Backend {
        let shape = detect_key_shape(&key);
        let model = |default: &str| settings.chat_model.clone().unwrap_or_else(|| default.into());
        let embedding =
            |default: &str| settings.embedding_model.clone().unwrap_or_else(|| default.into());

        match shape {
            KeyShape::Anthropic => Backend::Anthropic(AnthropicClient::new(
                self.http.clone(),
                settings
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| ANTHROPIC_BASE_URL.into()),
                key,
                model(ANTHROPIC_CHAT_MODEL),
            )),
            KeyShape::Gemini => Backend::OpenAi(OpenAiCompatible::new(
                self.http.clone(),
                OpenAiSettings {
                    label: "gemini".into(),
                    base_url: settings
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| GEMINI_BASE_URL.into()),
                    api_key: Some(key),
                    chat_model: model(GEMINI_CHAT_MODEL),
                    embedding_model: embedding(GEMINI_EMBEDDING_MODEL),
                    dimensions: Some(self.managed.embedding_dimension),
                },
            )),
            KeyShape::OpenAi => Backend::OpenAi(OpenAiCompatible::new(
                self.http.clone(),
                OpenAiSettings {
                    label: "openai".into(),
                    base_url: settings
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| OPENAI_BASE_URL.into()),
                    api_key: Some(key),
                    chat_model: model(OPENAI_CHAT_MODEL),
                    embedding_model: embedding(OPENAI_EMBEDDING_MODEL),
                    dimensions: Some(self.managed.embedding_dimension),
                },
            )),
        }
    }
}

#[async_trait]
impl ProviderResolver for DirectoryProviderResolver {
    async fn resolve(
        &self,
        organization_id: Uuid,
    ) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let settings = self.directory.provider_settings(organization_id).await?;
        let credential = settings
            .sealed_credential
            .as_deref()
            .map(|sealed| self.vault.reveal(sealed))
            .transpose()?;
        let provider = self.build(&settings, credential)?;
        tracing::debug!(
            organization = %organization_id,
            mode = settings.mode.as_str(),
            provider = provider.label(),
            "Resolved model provider"
        );
        Ok(Arc::new(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{OrganizationPolicy, PlaintextVault, SqliteCatalog};
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn managed(base_url: &str) -> ManagedProviderSettings {
        ManagedProviderSettings {
            base_url: base_url.into(),
            api_key: Some("managed-key".into()),
            chat_model: "managed-chat".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimension: 2,
        }
    }

    fn resolver(catalog: Arc<SqliteCatalog>, base_url: &str) -> DirectoryProviderResolver {
        DirectoryProviderResolver::new(
            catalog,
            Arc::new(PlaintextVault),
            managed(base_url),
            RetryPolicy::none(),
        )
        .expect("resolver")
    }

    fn byo(key: &str) -> ProviderSettings {
        ProviderSettings {
            mode: ProviderMode::ByoKey,
            sealed_credential: Some(key.into()),
            ..ProviderSettings::default()
        }
    }

    #[test]
    fn key_prefixes_select_the_vendor() {
        assert_eq!(detect_key_shape("sk-ant-api03-abc"), KeyShape::Anthropic);
        assert_eq!(detect_key_shape("AIzaSyExample"), KeyShape::Gemini);
        assert_eq!(detect_key_shape("sk-proj-123"), KeyShape::OpenAi);
        assert_eq!(detect_key_shape("anything-else"), KeyShape::OpenAi);
    }

    #[test]
    fn byo_settings_pick_vendor_defaults() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let resolver = resolver(catalog, "http://managed.invalid/v1");

        let anthropic = resolver
            .build(&byo("sk-ant-x"), Some("sk-ant-x".into()))
            .expect("anthropic");
        assert_eq!(anthropic.label(), "anthropic");
        assert_eq!(anthropic.chat_model(), ANTHROPIC_CHAT_MODEL);
        assert_eq!(anthropic.embedding_model(), "text-embedding-3-small");

        let gemini = resolver
            .build(&byo("AIzaKey"), Some("AIzaKey".into()))
            .expect("gemini");
        assert_eq!(gemini.label(), "gemini");
        assert_eq!(gemini.embedding_model(), GEMINI_EMBEDDING_MODEL);
    }

    #[test]
    fn incomplete_settings_are_configuration_errors() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let resolver = resolver(catalog, "http://managed.invalid/v1");

        let missing_key = resolver.build(&byo("sk-x"), None);
        assert!(matches!(missing_key, Err(ProviderError::Configuration(_))));

        let self_hosted = ProviderSettings {
            mode: ProviderMode::SelfHosted,
            ..ProviderSettings::default()
        };
        assert!(matches!(
            resolver.build(&self_hosted, None),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn settings_are_read_on_every_resolution() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let org = Uuid::from_u128(1);
        catalog
            .create_organization(
                org,
                "Acme",
                &ProviderSettings::default(),
                OrganizationPolicy::default(),
            )
            .expect("org");
        let resolver = resolver(Arc::clone(&catalog), "http://managed.invalid/v1");

        let first = resolver.resolve(org).await.expect("managed");
        assert_eq!(first.label(), "managed");

        catalog
            .update_provider_settings(org, &byo("sk-ant-live"))
            .expect("update");
        let second = resolver.resolve(org).await.expect("byo");
        assert_eq!(second.label(), "anthropic");
    }

    #[tokio::test]
    async fn self_hosted_without_embeddings_falls_back_to_managed() {
        let self_hosted = MockServer::start_async().await;
        let managed_server = MockServer::start_async().await;
        let unsupported = self_hosted
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(404).body("404 page not found");
            })
            .await;
        let fallback = managed_server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("authorization", "Bearer managed-key");
                then.status(200)
                    .json_body(json!({ "data": [{ "embedding": [0.6, 0.8] }] }));
            })
            .await;

        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let resolver = resolver(catalog, &format!("{}/v1", managed_server.base_url()));
        let settings = ProviderSettings {
            mode: ProviderMode::SelfHosted,
            endpoint: Some(format!("{}/v1", self_hosted.base_url())),
            chat_model: Some("llama3".into()),
            embedding_model: Some("llama3".into()),
            ..ProviderSettings::default()
        };
        let provider = resolver.build(&settings, None).expect("provider");

        let first = provider.generate_embedding("one").await.expect("first");
        let second = provider.generate_embedding("two").await.expect("second");

        assert_eq!(first, vec![0.6, 0.8]);
        assert_eq!(second, vec![0.6, 0.8]);
        assert_eq!(unsupported.hits(), 1);
        assert_eq!(fallback.hits(), 2);
        assert_eq!(provider.embedding_model(), "text-embedding-3-small");
    }

    #[tokio::test]
    async fn rate_limited_requests_succeed_once_the_limit_lifts() {
        let server = MockServer::start_async().await;
        let limited = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(429).body("Rate limit reached for requests");
            })
            .await;

        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let resolver = DirectoryProviderResolver::new(
            catalog,
            Arc::new(PlaintextVault),
            managed(&format!("{}/v1", server.base_url())),
            RetryPolicy::new(8, std::time::Duration::from_millis(100)),
        )
        .expect("resolver");
        let provider = resolver
            .build(&ProviderSettings::default(), None)
            .expect("managed");
        let call = tokio::spawn(async move { provider.generate_embedding("hello").await });

        while limited.hits_async().await == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        limited.delete_async().await;
        let recovered = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200)
                    .json_body(json!({ "data": [{ "embedding": [0.6, 0.8] }] }));
            })
            .await;

        let embedding = call.await.expect("join").expect("embedding");
        assert_eq!(embedding, vec![0.6, 0.8]);
        assert_eq!(recovered.hits_async().await, 1);
    }
}
