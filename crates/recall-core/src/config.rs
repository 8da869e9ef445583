//! ============================================================================
//! Engine Configuration - Environment-driven tunables
//! ============================================================================
//! Every knob has a default so the engine runs with an empty environment.
//! The binary loads `.env` first; the library only reads the process env.
//! ============================================================================

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::types::{MemoryError, MemoryResult};

/// Default embedding model (OpenAI compatible)
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Expected embedding dimension for text-embedding-3-small
pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

/// Default Qdrant collection for message vectors
pub const DEFAULT_COLLECTION: &str = "conversation_memory";

/// Cosine floor for recalled messages; unrelated turns score near zero
pub const DEFAULT_MIN_SCORE: f32 = 0.25;

/// How far semantic retrieval reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalScope {
    /// Any conversation owned by the same user
    #[default]
    User,
    /// Only the conversation being answered
    Conversation,
}

impl FromStr for RetrievalScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(RetrievalScope::User),
            "conversation" => Ok(RetrievalScope::Conversation),
            _ => Err(format!("Unknown retrieval scope: {}", s)),
        }
    }
}

/// Whether indexing runs before `append_message` returns or on a spawned task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexingMode {
    Inline,
    #[default]
    Background,
}

impl FromStr for IndexingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(IndexingMode::Inline),
            "background" => Ok(IndexingMode::Background),
            _ => Err(format!("Unknown indexing mode: {}", s)),
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// R: most recent messages always considered
    pub recent_window_size: usize,
    /// K: semantic neighbours requested from the index
    pub retrieved_top_k: usize,
    /// Default context budget in estimated tokens
    pub context_token_budget: usize,
    /// Minimum cosine similarity for retrieved items (<= 0.0 sends no threshold)
    pub retrieval_min_score: f32,
    pub retrieval_scope: RetrievalScope,
    /// Retry policy for embedding calls
    pub embedding_retry: RetryConfig,
    /// Memo cache lifetime for identical embedding inputs
    pub embedding_cache_ttl: Duration,
    pub embedding_dim: usize,
    pub embedding_model: String,
    pub embedding_base_url: String,
    pub openai_api_key: Option<String>,
    /// Minimum age before a pending/failed message is re-indexed
    pub reindex_grace_period: Duration,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_collection: String,
    /// Bound on every outbound embedding/index call
    pub request_timeout: Duration,
    pub db_path: Option<PathBuf>,
    pub indexing_mode: IndexingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recent_window_size: 10,
            retrieved_top_k: 5,
            context_token_budget: 2000,
            retrieval_min_score: DEFAULT_MIN_SCORE,
            retrieval_scope: RetrievalScope::User,
            embedding_retry: RetryConfig::default(),
            embedding_cache_ttl: Duration::from_secs(300),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            reindex_grace_period: Duration::from_secs(60),
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            qdrant_collection: DEFAULT_COLLECTION.to_string(),
            request_timeout: Duration::from_secs(10),
            db_path: None,
            indexing_mode: IndexingMode::Background,
        }
    }
}

impl EngineConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> MemoryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> MemoryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RECENT_WINDOW_SIZE") {
            config.recent_window_size = parse_var("RECENT_WINDOW_SIZE", &v)?;
        }
        if let Some(v) = get("RETRIEVED_TOP_K") {
            config.retrieved_top_k = parse_var("RETRIEVED_TOP_K", &v)?;
        }
        if let Some(v) = get("CONTEXT_TOKEN_BUDGET") {
            config.context_token_budget = parse_var("CONTEXT_TOKEN_BUDGET", &v)?;
        }
        if let Some(v) = get("RETRIEVAL_MIN_SCORE") {
            config.retrieval_min_score = parse_var("RETRIEVAL_MIN_SCORE", &v)?;
        }
        if let Some(v) = get("RETRIEVAL_SCOPE") {
            config.retrieval_scope = parse_var("RETRIEVAL_SCOPE", &v)?;
        }
        if let Some(v) = get("EMBEDDING_RETRY_ATTEMPTS") {
            config.embedding_retry.max_attempts = parse_var("EMBEDDING_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("EMBEDDING_RETRY_BACKOFF_BASE") {
            config.embedding_retry.base_delay_ms = parse_var("EMBEDDING_RETRY_BACKOFF_BASE", &v)?;
        }
        if let Some(v) = get("EMBEDDING_RETRY_MAX_DELAY") {
            config.embedding_retry.max_delay_ms = parse_var("EMBEDDING_RETRY_MAX_DELAY", &v)?;
        }
        if let Some(v) = get("EMBEDDING_CACHE_TTL") {
            config.embedding_cache_ttl = Duration::from_secs(parse_var("EMBEDDING_CACHE_TTL", &v)?);
        }
        if let Some(v) = get("EMBEDDING_DIM") {
            config.embedding_dim = parse_var("EMBEDDING_DIM", &v)?;
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            config.embedding_model = v;
        }
        if let Some(v) = get("EMBEDDING_BASE_URL") {
            config.embedding_base_url = v.trim_end_matches('/').to_string();
        }
        config.openai_api_key = get("OPENAI_API_KEY");
        if let Some(v) = get("REINDEX_GRACE_PERIOD") {
            config.reindex_grace_period = Duration::from_secs(parse_var("REINDEX_GRACE_PERIOD", &v)?);
        }
        if let Some(v) = get("QDRANT_URL") {
            config.qdrant_url = v;
        }
        config.qdrant_api_key = get("QDRANT_API_KEY");
        if let Some(v) = get("QDRANT_COLLECTION") {
            config.qdrant_collection = v;
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            config.request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT", &v)?);
        }
        config.db_path = get("RECALL_DB_PATH").map(PathBuf::from);
        if let Some(v) = get("INDEXING_MODE") {
            config.indexing_mode = parse_var("INDEXING_MODE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> MemoryResult<()> {
        if self.recent_window_size == 0 {
            return Err(MemoryError::Config(
                "RECENT_WINDOW_SIZE must be at least 1".to_string(),
            ));
        }
        if self.embedding_retry.max_attempts == 0 {
            return Err(MemoryError::Config(
                "EMBEDDING_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.embedding_dim == 0 {
            return Err(MemoryError::Config("EMBEDDING_DIM must be positive".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval_min_score) {
            return Err(MemoryError::Config(
                "RETRIEVAL_MIN_SCORE must be within [-1, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> MemoryResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| MemoryError::Config(format!("{} = '{}': {}", name, raw, e)))
}
