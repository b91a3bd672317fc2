//! In-process provider doubles shared by unit tests.

use crate::provider::{
    CompletionOptions, ModelProvider, ProviderError, ProviderResolver, TokenSink,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bag-of-words embedding: each lowercase word lands in a slot picked by its bytes.
pub fn word_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut embedding = vec![0.0_f32; dimension];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let slot = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as usize));
        embedding[slot % dimension] += 1.0;
    }
    let norm = embedding.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut embedding {
            *value /= norm;
        }
    }
    embedding
}

/// Provider answering from scripts instead of the network.
pub struct ScriptedProvider {
    dimension: usize,
    completions: Mutex<VecDeque<Result<String, ProviderError>>>,
    tokens: Mutex<Vec<String>>,
    embedding_failure: Mutex<Option<String>>,
    stream_failure: Mutex<Option<String>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            completions: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(vec!["Hello".into(), " world".into()]),
            embedding_failure: Mutex::new(None),
            stream_failure: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next completion result.
    pub fn push_completion(&self, result: Result<String, ProviderError>) {
        self.completions.lock().expect("lock").push_back(result);
    }

    pub fn set_tokens(&self, tokens: &[&str]) {
        *self.tokens.lock().expect("lock") = tokens.iter().map(|t| t.to_string()).collect();
    }

    /// Make every embedding call fail with a 401.
    pub fn fail_embeddings(&self, message: &str) {
        *self.embedding_failure.lock().expect("lock") = Some(message.to_string());
    }

    /// Make streaming fail after the scripted tokens.
    pub fn fail_stream(&self, message: &str) {
        *self.stream_failure.lock().expect("lock") = Some(message.to_string());
    }

    /// `(system prompt, prompt)` pairs seen by `stream_completion`.
    pub fn streamed_prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn label(&self) -> &str {
        "scripted"
    }

    fn embedding_model(&self) -> &str {
        "scripted-embed"
    }

    fn chat_model(&self) -> &str {
        "scripted-chat"
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if let Some(message) = self.embedding_failure.lock().expect("lock").clone() {
            return Err(ProviderError::Http {
                provider: "scripted".into(),
                status: 401,
                body: message,
            });
        }
        Ok(word_embedding(text, self.dimension))
    }

    async fn generate_completion(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.completions
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok("{}".into()))
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        system_prompt: &str,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.prompts
            .lock()
            .expect("lock")
            .push((system_prompt.to_string(), prompt.to_string()));
        let tokens = self.tokens.lock().expect("lock").clone();
        for token in tokens {
            if cancel.is_cancelled() || sink.send(token).await.is_err() {
                return Ok(());
            }
        }
        match self.stream_failure.lock().expect("lock").clone() {
            Some(message) => Err(ProviderError::from_stream_error("scripted", message)),
            None => Ok(()),
        }
    }
}

/// Resolver handing out one provider to every organization.
pub struct StaticResolver {
    provider: Arc<dyn ModelProvider>,
}

impl StaticResolver {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ProviderResolver for StaticResolver {
    async fn resolve(&self, _organization_id: Uuid) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        Ok(Arc::clone(&self.provider))
    }
}
