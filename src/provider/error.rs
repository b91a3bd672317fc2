//! Error type shared by every model provider.

use crate::catalog::{CatalogError, VaultError};
use reqwest::StatusCode;
use thiserror::Error;

const RATE_LIMIT_MARKERS: [&str; 6] = [
    "rate limit",
    "rate_limit",
    "quota",
    "resource_exhausted",
    "too many requests",
    "overloaded",
];

const UNSUPPORTED_MARKERS: [&str; 5] = [
    "not supported",
    "does not support",
    "unsupported",
    "not found",
    "no such model",
];

/// Errors surfaced while talking to an LLM provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider throttled the request.
    #[error("{provider} rate limited the request: {message}")]
    RateLimited {
        /// Provider label, e.g. `openai`.
        provider: String,
        /// Message returned by the provider.
        message: String,
    },
    /// The provider cannot produce embeddings with the configured model.
    #[error("{provider} cannot generate embeddings: {message}")]
    EmbeddingsUnsupported {
        /// Provider label.
        provider: String,
        /// Message returned by the provider.
        message: String,
    },
    /// The provider answered with an unexpected status.
    #[error("{provider} returned {status}: {body}")]
    Http {
        /// Provider label.
        provider: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The request never produced a response.
    #[error("Provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider answered with a body we could not interpret.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// The organization's provider settings are unusable.
    #[error("Provider misconfigured: {0}")]
    Configuration(String),
    /// Provider settings could not be loaded.
    #[error("Provider settings unavailable: {0}")]
    Catalog(#[from] CatalogError),
    /// The stored credential could not be revealed.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// What the failed request was doing, which decides how statuses are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Embedding,
    Completion,
}

impl ProviderError {
    /// Classify a non-success response.
    pub(crate) fn from_status(
        provider: &str,
        status: StatusCode,
        body: String,
        operation: Operation,
    ) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || mentions_rate_limit(&body) {
            return Self::RateLimited {
                provider: provider.to_string(),
                message: body,
            };
        }

        let unsupported = match status {
            StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => true,
            StatusCode::BAD_REQUEST => mentions_unsupported(&body),
            _ => false,
        };
        if operation == Operation::Embedding && unsupported {
            return Self::EmbeddingsUnsupported {
                provider: provider.to_string(),
                message: body,
            };
        }

        Self::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        }
    }

    /// Classify an error event received mid-stream.
    pub(crate) fn from_stream_error(provider: &str, message: String) -> Self {
        if mentions_rate_limit(&message) {
            Self::RateLimited {
                provider: provider.to_string(),
                message,
            }
        } else {
            Self::InvalidResponse(format!("{provider} stream error: {message}"))
        }
    }

    /// Whether the provider throttled the request.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether the provider lacks embedding support.
    pub fn is_embedding_unsupported(&self) -> bool {
        matches!(self, Self::EmbeddingsUnsupported { .. })
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Transport(error) => error.is_connect() || error.is_timeout(),
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Whether a provider message describes throttling or exhausted quota.
pub(crate) fn mentions_rate_limit(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn mentions_unsupported(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    UNSUPPORTED_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
