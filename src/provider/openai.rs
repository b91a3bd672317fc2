//! OpenAI-compatible HTTP backend.
//!
//! Serves the managed provider, OpenAI and Gemini keys (through Gemini's OpenAI-compatible
//! endpoint) and self-hosted runtimes such as vLLM or Ollama.

use super::error::Operation;
use super::sse::{StreamStep, pump_events};
use super::{CompletionOptions, ProviderError, TokenSink};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiSettings {
    /// Label used in logs and errors.
    pub label: String,
    /// Base URL including the version prefix, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token, omitted for keyless self-hosted servers.
    pub api_key: Option<String>,
    /// Model used for completions.
    pub chat_model: String,
    /// Model used for embeddings.
    pub embedding_model: String,
    /// Requested vector size, sent to models that accept one.
    pub dimensions: Option<usize>,
}

/// Client for `/embeddings` and `/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    http: Client,
    settings: OpenAiSettings,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatible {
    /// Wrap a shared HTTP client.
    pub fn new(http: Client, settings: OpenAiSettings) -> Self {
        Self { http, settings }
    }

    /// Provider label.
    pub fn label(&self) -> &str {
        &self.settings.label
    }

    /// Completion model.
    pub fn chat_model(&self) -> &str {
        &self.settings.chat_model
    }

    /// Embedding model.
    pub fn embedding_model(&self) -> &str {
        &self.settings.embedding_model
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut body = json!({
            "model": self.settings.embedding_model,
            "input": text,
        });
        if let Some(dimensions) = self.settings.dimensions
            && self.settings.embedding_model.starts_with("text-embedding-3")
        {
            body["dimensions"] = json!(dimensions);
        }

        let response = self
            .request("embeddings")
            .json(&body)
            .send()
            .await?;
        let response = self.check(response, Operation::Embedding).await?;

        let EmbeddingResponse { data } = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
        let embedding = data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("embedding response was empty".into()))?;

        tracing::trace!(
            provider = self.label(),
            model = self.embedding_model(),
            dimension = embedding.len(),
            "Embedding generated"
        );
        Ok(embedding)
    }

    /// Run a non-streaming completion.
    pub async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let mut body = self.chat_body(prompt, options.system_prompt.as_deref(), false);
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if options.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .request("chat/completions")
            .json(&body)
            .send()
            .await?;
        let response = self.check(response, Operation::Completion).await?;

        let ChatResponse { choices } = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
        choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ProviderError::InvalidResponse("completion had no content".into()))
    }

    /// Open a streaming completion. Errors here happen before any token was produced.
    pub async fn open_stream(
        &self,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = self.chat_body(prompt, Some(system_prompt), true);
        let response = self
            .request("chat/completions")
            .json(&body)
            .send()
            .await?;
        self.check(response, Operation::Completion).await
    }

    /// Forward `delta.content` fragments until `[DONE]`.
    pub async fn pump_stream(
        &self,
        response: reqwest::Response,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let label = self.label().to_string();
        pump_events(response, sink, cancel, move |data| {
            if data == "[DONE]" {
                return Ok(StreamStep::Done);
            }
            let chunk: StreamChunk = serde_json::from_str(data)
                .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
            if let Some(error) = chunk.error {
                return Err(ProviderError::from_stream_error(&label, error.to_string()));
            }
            Ok(chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .map_or(StreamStep::Skip, StreamStep::Token))
        })
        .await
    }

    fn chat_body(&self, prompt: &str, system_prompt: Option<&str>, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = system_prompt {
            messages.push(json!({ "role": "system", "content": system_prompt }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        json!({
            "model": self.settings.chat_model,
            "messages": messages,
            "stream": stream,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{path}", self.settings.base_url.trim_end_matches('/'));
        let request = self.http.post(url);
        match self.settings.api_key.as_deref() {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    async fn check(
        &self,
        response: reqwest::Response,
        operation: Operation,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = ProviderError::from_status(self.label(), status, body, operation);
        tracing::warn!(provider = self.label(), status = %status, error = %error, "Provider request failed");
        Err(error)
    }
}
