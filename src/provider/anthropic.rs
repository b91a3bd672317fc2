//! Anthropic Messages API backend. Anthropic has no embedding endpoint.

use super::error::Operation;
use super::sse::{StreamStep, pump_events};
use super::{CompletionOptions, ProviderError, TokenSink};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Default API host.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const JSON_INSTRUCTION: &str = "Respond with a single JSON object and nothing else.";

/// Client for `/v1/messages`.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    MessageStop,
    Error { error: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    /// Build a client for `base_url` (usually [`ANTHROPIC_BASE_URL`]).
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        chat_model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            chat_model: chat_model.into(),
        }
    }

    /// Completion model.
    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    /// Always fails: the caller is expected to fall back to the managed embedder.
    pub fn embed(&self) -> ProviderError {
        ProviderError::EmbeddingsUnsupported {
            provider: "anthropic".into(),
            message: "the Messages API has no embedding endpoint".into(),
        }
    }

    /// Run a non-streaming completion.
    pub async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let system = match (options.system_prompt.as_deref(), options.json_mode) {
            (Some(system), true) => Some(format!("{system}\n\n{JSON_INSTRUCTION}")),
            (Some(system), false) => Some(system.to_string()),
            (None, true) => Some(JSON_INSTRUCTION.to_string()),
            (None, false) => None,
        };
        let body = self.body(
            prompt,
            system.as_deref(),
            options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            false,
        );

        let response = self.request().json(&body).send().await?;
        let response = self.check(response).await?;
        let MessagesResponse { content } = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;

        let text: String = content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "completion had no text blocks".into(),
            ));
        }
        Ok(text.trim().to_string())
    }

    /// Open a streaming completion.
    pub async fn open_stream(
        &self,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = self.body(prompt, Some(system_prompt), DEFAULT_MAX_TOKENS, true);
        let response = self.request().json(&body).send().await?;
        self.check(response).await
    }

    /// Forward `content_block_delta` text until `message_stop`.
    pub async fn pump_stream(
        &self,
        response: reqwest::Response,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        pump_events(response, sink, cancel, |data| {
            let event: StreamEvent = serde_json::from_str(data)
                .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
            match event {
                StreamEvent::ContentBlockDelta { delta } => Ok(delta
                    .text
                    .filter(|text| !text.is_empty())
                    .map_or(StreamStep::Skip, StreamStep::Token)),
                StreamEvent::MessageStop => Ok(StreamStep::Done),
                StreamEvent::Error { error } => Err(ProviderError::from_stream_error(
                    "anthropic",
                    error.to_string(),
                )),
                StreamEvent::Other => Ok(StreamStep::Skip),
            }
        })
        .await
    }

    fn body(&self, prompt: &str, system: Option<&str>, max_tokens: u32, stream: bool) -> Value {
        let mut body = json!({
            "model": self.chat_model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        body
    }

    fn request(&self) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = ProviderError::from_status("anthropic", status, body, Operation::Completion);
        tracing::warn!(status = %status, error = %error, "Anthropic request failed");
        Err(error)
    }
}
