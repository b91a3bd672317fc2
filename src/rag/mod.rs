//! Grounded question answering.
//!
//! [`RagOrchestrator::answer`] retrieves the caller-visible chunks closest to a question, builds a
//! numbered context, streams the model's answer and returns citations for the chunks it was given.
//! [`RagOrchestrator::chat_single_scope`] does the same inside one artifact and refuses to
//! wander outside it.

/// Answer orchestration.
pub mod orchestrator;
pub mod prompt;

use crate::catalog::{ArtifactKind, CallerIdentity, CatalogError};
use crate::index::{ArtifactKinds, Locator};
use crate::provider::ProviderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use orchestrator::{RagOrchestrator, RagSettings};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The person asking.
    User,
    /// The model.
    Assistant,
}

/// One earlier message of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who spoke.
    pub role: TurnRole,
    /// What was said.
    pub content: String,
}

/// Organization-wide question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagRequest {
    /// The question to answer.
    pub question: String,
    /// Earlier turns, oldest first.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Who is asking; decides the retrieval scope.
    pub caller: CallerIdentity,
    /// Artifact kinds to draw from.
    #[serde(default)]
    pub kinds: ArtifactKinds,
}

/// Source handed to the model for an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// Cited artifact.
    pub artifact_id: Uuid,
    /// Document or article.
    pub artifact_kind: ArtifactKind,
    /// Artifact title.
    pub title: String,
    /// Page or section of the cited chunk.
    pub locator: Locator,
    /// Name of the owning division, `None` for organization-wide artifacts.
    pub division_name: Option<String>,
    /// Start of the cited chunk.
    pub excerpt: String,
    /// Cosine similarity of the chunk to the question.
    pub similarity: f32,
}

/// Errors that prevent an answer from being produced.
#[derive(Debug, Error)]
pub enum RagError {
    /// Provider resolution or generation failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The artifact or organization could not be loaded.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The question was blank.
    #[error("Question is empty")]
    EmptyQuestion,
}

impl RagError {
    /// Whether the referenced artifact does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Catalog(error) if error.is_not_found())
    }
}
