//! Records exchanged with the catalog collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of artifact subject to ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Uploaded file; located by page.
    Document,
    /// Published article; located by section.
    Article,
}

impl ArtifactKind {
    /// Stable storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Article => "article",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "article" => Ok(Self::Article),
            other => Err(format!("unknown artifact kind `{other}`")),
        }
    }
}

/// Processing state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Created but never ingested.
    Unprocessed,
    /// An ingestion run is in flight.
    Processing,
    /// Last run succeeded; chunks are searchable.
    Completed,
    /// Last run failed; the error field explains why.
    Failed,
}

impl ProcessingStatus {
    /// Stable storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(Self::Unprocessed),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing status `{other}`")),
        }
    }
}

/// Current UTC time in RFC 3339.
pub(crate) fn rfc3339_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// One entry of an artifact's append-only progress log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Human-readable description of the step.
    pub message: String,
    /// Completion estimate, 0 to 100.
    pub progress: u8,
}

impl ProgressEntry {
    /// Entry stamped with the current time.
    pub fn now(message: impl Into<String>, progress: u8) -> Self {
        Self {
            timestamp: rfc3339_now(),
            message: message.into(),
            progress: progress.min(100),
        }
    }
}

/// Artifact row as seen by the ingestion pipeline and the chat variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    /// Artifact identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub organization_id: Uuid,
    /// `None` marks an organization-wide artifact.
    pub division_id: Option<Uuid>,
    /// Document or article.
    pub kind: ArtifactKind,
    /// Display title.
    pub title: String,
    /// Original file name of an upload.
    pub file_name: Option<String>,
    /// MIME type of the stored content.
    pub media_type: String,
    /// Short description shown in listings.
    pub summary: Option<String>,
    /// Processing state.
    pub status: ProcessingStatus,
    /// Whether the artifact's chunks are searchable.
    pub processed: bool,
    /// Whether the artifact is published. Withdrawn artifacts are excluded from retrieval.
    pub published: bool,
    /// Message of the last failed run.
    pub error: Option<String>,
    /// Embedding model used by the last run.
    pub embedding_model: Option<String>,
    /// Incremented by every completed run.
    pub embedding_version: i64,
}

/// Raw content of an artifact handed to the text extractor.
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    /// Stored content.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`.
    pub media_type: String,
    /// Original file name.
    pub file_name: Option<String>,
}

/// Status view returned to the CRUD layer while it polls an artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactStatus {
    /// Processing state.
    pub status: ProcessingStatus,
    /// Append-only progress entries, oldest first.
    pub progress_log: Vec<ProgressEntry>,
    /// Whether chunks are searchable.
    pub processed: bool,
    /// Message of the last failed run.
    pub error: Option<String>,
}

/// Artifact creation request used by the catalog adapter and tests.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Artifact identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub organization_id: Uuid,
    /// Owning division, `None` for organization-wide.
    pub division_id: Option<Uuid>,
    /// Document or article.
    pub kind: ArtifactKind,
    /// Display title.
    pub title: String,
    /// Original file name.
    pub file_name: Option<String>,
    /// MIME type of `content`.
    pub media_type: String,
    /// Short description.
    pub summary: Option<String>,
    /// Raw content.
    pub content: Vec<u8>,
}

/// Role tiers, lowest privilege first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sees their division and organization-wide artifacts.
    Member,
    /// Like a member unless the organization allows cross-division queries.
    Manager,
    /// Sees the whole organization.
    Admin,
    /// Organization owner; same visibility as an admin.
    Owner,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "member" => Ok(Self::Member),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Identity of the user asking a question, as established by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Asking user.
    pub user_id: Uuid,
    /// Tenant the user belongs to.
    pub organization_id: Uuid,
    /// User's division, if any.
    #[serde(default)]
    pub division_id: Option<Uuid>,
    /// User's role in the organization.
    pub role: Role,
}

/// Which backend family an organization talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// The operator-run default backend.
    Managed,
    /// The organization's own API key for a hosted vendor.
    ByoKey,
    /// An OpenAI-protocol server run by the organization.
    SelfHosted,
}

impl ProviderMode {
    /// Stable storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::ByoKey => "byo_key",
            Self::SelfHosted => "self_hosted",
        }
    }
}

impl FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(Self::Managed),
            "byo_key" => Ok(Self::ByoKey),
            "self_hosted" => Ok(Self::SelfHosted),
            other => Err(format!("unknown provider mode `{other}`")),
        }
    }
}

/// Per-organization provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Backend family.
    pub mode: ProviderMode,
    /// Base URL for self-hosted servers.
    pub endpoint: Option<String>,
    /// Encrypted credential; only the vault can reveal it.
    pub sealed_credential: Option<String>,
    /// Chat model override.
    pub chat_model: Option<String>,
    /// Embedding model override.
    pub embedding_model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Managed,
            endpoint: None,
            sealed_credential: None,
            chat_model: None,
            embedding_model: None,
        }
    }
}

/// Organization-level switches that influence retrieval scoping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrganizationPolicy {
    /// Lets managers query across divisions.
    pub cross_division_query: bool,
}

/// Best-effort audit record of model usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    /// Charged tenant.
    pub organization_id: Uuid,
    /// Artifact involved, if any.
    pub artifact_id: Option<Uuid>,
    /// Operation label, e.g. `rag_query`.
    pub operation: String,
    /// Model used.
    pub model: String,
    /// Approximate tokens consumed.
    pub estimated_tokens: u64,
}

/// Named entity extracted from an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    /// Entity name, unique per artifact.
    pub name: String,
    /// Free-form type, e.g. `person`.
    #[serde(default, rename = "type")]
    pub entity_type: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
}

/// Relationship between two persisted entities of the same artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelationship {
    /// Entity the relationship starts at.
    pub source_entity_id: Uuid,
    /// Entity the relationship points to.
    pub target_entity_id: Uuid,
    /// Free-form relationship type.
    pub relation_type: String,
    /// Short description.
    pub description: String,
}

/// Claimed ingestion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionJob {
    /// Job row identifier.
    pub id: i64,
    /// Artifact to ingest.
    pub artifact_id: Uuid,
    /// Attempts made before this claim.
    pub attempts: u32,
}
