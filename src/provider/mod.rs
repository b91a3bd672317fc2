//! Model provider abstraction.
//!
//! Every organization talks to exactly one provider at a time: the managed default, a
//! bring-your-own key, or a self-hosted OpenAI-compatible endpoint. Callers only see
//! [`ModelProvider`]; the resolver in [`resolve`] picks the backend per call from the current
//! organization settings and wraps it with rate-limit retries and the managed embedding
//! fallback.

pub mod anthropic;
pub mod error;
pub mod metadata;
pub mod openai;
pub mod resolve;
pub mod retry;
pub mod sse;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::ProviderError;
pub use metadata::{DocumentMetadata, MetadataRequest};
pub use resolve::{
    ConfiguredProvider, DirectoryProviderResolver, KeyShape, ManagedProviderSettings,
    ProviderResolver, detect_key_shape,
};
pub use retry::{RetryPolicy, with_retry};

/// Channel receiving streamed completion tokens, in order.
pub type TokenSink = mpsc::Sender<String>;

/// Knobs for a single non-streaming completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOptions {
    /// Instructions sent ahead of the prompt.
    pub system_prompt: Option<String>,
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
    /// Ask the model for a single JSON object.
    pub json_mode: bool,
}

impl CompletionOptions {
    /// Options with a system prompt and nothing else.
    pub fn with_system(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            ..Self::default()
        }
    }

    /// Same options, requesting JSON output.
    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Same options, capping output tokens.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Capabilities every provider exposes.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short name used in logs and usage records.
    fn label(&self) -> &str;

    /// Model used for embeddings.
    fn embedding_model(&self) -> &str;

    /// Model used for completions.
    fn chat_model(&self) -> &str;

    /// Embed one text.
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Run a completion and return the full answer.
    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Stream completion tokens into `sink` until the answer ends or `cancel` fires.
    ///
    /// Cancellation and a dropped receiver end the stream without error.
    async fn stream_completion(
        &self,
        prompt: &str,
        system_prompt: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Propose a title, summary, tags, language and type for an uploaded file.
    ///
    /// Malformed model output falls back to values derived from the file itself.
    async fn generate_document_metadata(
        &self,
        request: MetadataRequest<'_>,
    ) -> Result<DocumentMetadata, ProviderError> {
        let text = request.text();
        let prompt = metadata::metadata_prompt(request.file_name, &text);
        let options = CompletionOptions::with_system(metadata::METADATA_SYSTEM_PROMPT)
            .json()
            .max_tokens(600);
        let raw = self.generate_completion(&prompt, &options).await?;
        Ok(metadata::metadata_from_completion(
            &raw,
            request.file_name,
            &text,
        ))
    }
}
