use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the knowledge-base server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path of the SQLite catalog holding artifacts, jobs and organization settings.
    pub catalog_path: String,
    /// Backend storing chunk vectors.
    pub chunk_store: ChunkStoreBackend,
    /// Base URL of the Qdrant instance that stores embeddings.
    pub qdrant_url: String,
    /// Name of the Qdrant collection holding chunk vectors.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// OpenAI-compatible base URL of the managed provider.
    pub managed_base_url: String,
    /// Credential for the managed provider.
    pub managed_api_key: Option<String>,
    /// Chat model used by the managed provider.
    pub managed_chat_model: String,
    /// Embedding model used by the managed provider and the embedding fallback.
    pub managed_embedding_model: String,
    /// Token budget per chunk.
    pub chunk_max_tokens: usize,
    /// Tokens of overlap carried between consecutive chunks.
    pub chunk_overlap_tokens: usize,
    /// Embedding calls allowed in flight during one ingestion run.
    pub embedding_concurrency: usize,
    /// Background ingestion workers.
    pub ingestion_workers: usize,
    /// Attempts per ingestion job before it is abandoned.
    pub ingestion_max_attempts: u32,
    /// Retries granted to a rate-limited provider call.
    pub retry_max_attempts: u32,
    /// Base delay of the exponential provider backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Chunks retrieved for an organization-wide answer.
    pub rag_top_k: usize,
    /// Similarity floor for organization-wide answers.
    pub rag_min_similarity: f32,
    /// Chunks retrieved for single-artifact chat.
    pub chat_top_k: usize,
    /// Similarity floor for single-artifact chat.
    pub chat_min_similarity: f32,
    /// Results returned by hybrid search.
    pub search_page_size: usize,
    /// Similarity floor for the vector branch of hybrid search.
    pub search_min_similarity: f32,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported chunk storage backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStoreBackend {
    /// Qdrant over its HTTP API.
    Qdrant,
    /// Process-local index, lost on restart.
    Memory,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            catalog_path: load_env_or("CATALOG_PATH", "data/rustykb.db"),
            chunk_store: load_env_or("CHUNK_STORE", "qdrant")
                .parse()
                .map_err(|()| ConfigError::InvalidValue("CHUNK_STORE".to_string()))?,
            qdrant_url: load_env_or("QDRANT_URL", "http://127.0.0.1:6333"),
            qdrant_collection_name: load_env_or("QDRANT_COLLECTION_NAME", "knowledge-chunks"),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_dimension: load_env("EMBEDDING_DIMENSION")?.parse().map_err(|_| {
                ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string())
            })?,
            managed_base_url: load_env_or("MANAGED_BASE_URL", "https://api.openai.com/v1"),
            managed_api_key: load_env_optional("MANAGED_API_KEY"),
            managed_chat_model: load_env_or("MANAGED_CHAT_MODEL", "gpt-4o-mini"),
            managed_embedding_model: load_env_or(
                "MANAGED_EMBEDDING_MODEL",
                "text-embedding-3-small",
            ),
            chunk_max_tokens: load_env_parsed("CHUNK_MAX_TOKENS", 400)?,
            chunk_overlap_tokens: load_env_parsed("CHUNK_OVERLAP_TOKENS", 50)?,
            embedding_concurrency: load_env_parsed("EMBEDDING_CONCURRENCY", 4)?,
            ingestion_workers: load_env_parsed("INGESTION_WORKERS", 2)?,
            ingestion_max_attempts: load_env_parsed("INGESTION_MAX_ATTEMPTS", 3)?,
            retry_max_attempts: load_env_parsed("RETRY_MAX_ATTEMPTS", 8)?,
            retry_base_delay_ms: load_env_parsed("RETRY_BASE_DELAY_MS", 3000)?,
            rag_top_k: load_env_parsed("RAG_TOP_K", 6)?,
            rag_min_similarity: load_env_parsed("RAG_MIN_SIMILARITY", 0.35)?,
            chat_top_k: load_env_parsed("CHAT_TOP_K", 4)?,
            chat_min_similarity: load_env_parsed("CHAT_MIN_SIMILARITY", 0.3)?,
            search_page_size: load_env_parsed("SEARCH_PAGE_SIZE", 20)?,
            search_min_similarity: load_env_parsed("SEARCH_MIN_SIMILARITY", 0.5)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn load_env_parsed<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for ChunkStoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        catalog = %config.catalog_path,
        chunk_store = ?config.chunk_store,
        qdrant_url = %config.qdrant_url,
        collection = %config.qdrant_collection_name,
        managed_base_url = %config.managed_base_url,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
