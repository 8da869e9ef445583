//! ============================================================================
//! Embedding Client - Vector embeddings for semantic memory search
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible `/embeddings` API.
//! [`EmbeddingClient`] wraps any provider with bounded exponential backoff,
//! permanent/transient error mapping, and a short-lived memo cache.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::retry::{calculate_delay, classify_error, classify_status, ErrorKind, RetryConfig};
use crate::types::{MemoryError, MemoryResult};

/// Maximum number of entries in the embedding cache to prevent unbounded growth
const MAX_CACHE_SIZE: usize = 1000;

/// Failure reported by a single provider call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ProviderError {
    fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Retryable => ProviderError::Transient(message),
            ErrorKind::RateLimited => ProviderError::RateLimited(message),
            ErrorKind::Permanent => ProviderError::Permanent(message),
        }
    }
}

/// A single outbound embedding call, no retries
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Model identifier sent with every request
    fn model(&self) -> &str;
}

// ============================================================================
// OpenAI-compatible HTTP provider
// ============================================================================

/// Embedding provider speaking the OpenAI `/embeddings` protocol
pub struct OpenAiEmbeddings {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAiEmbeddings {
    /// Create a provider against an arbitrary OpenAI-compatible endpoint
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> MemoryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    /// Create the provider described by the engine configuration
    pub fn from_config(config: &EngineConfig) -> MemoryResult<Self> {
        if config.openai_api_key.is_none() {
            warn!("OPENAI_API_KEY not set, embedding requests will be sent unauthenticated");
        }
        Self::new(
            config.openai_api_key.clone(),
            config.embedding_base_url.clone(),
            config.embedding_model.clone(),
            config.request_timeout,
        )
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Generate embeddings for multiple texts, in input order
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(error) => format!("Embedding API error ({}): {}", status, error.error.message),
                Err(_) => format!("Embedding API error ({}): {}", status, body),
            };
            return Err(ProviderError::from_kind(
                classify_status(status.as_u16(), &body),
                message,
            ));
        }

        // A truncated or proxy-mangled body is worth another attempt
        let embedding_response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Transient(format!("Failed to parse embedding response: {}", e))
        })?;

        if let Some(usage) = &embedding_response.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, embedding_response.model
            );
        }

        let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transient("No embedding returned".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    let message = format!("Embedding request failed: {}", e);
    if e.is_timeout() || e.is_connect() {
        return ProviderError::Transient(message);
    }
    ProviderError::from_kind(classify_error(&message), message)
}

// ============================================================================
// Retrying, caching client
// ============================================================================

#[derive(Debug, Clone)]
struct CachedEmbedding {
    vector: Vec<f32>,
    cached_at: Instant,
}

/// Embedding client with retry/backoff and a TTL memo cache
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryConfig,
    dimension: usize,
    cache: RwLock<HashMap<String, CachedEmbedding>>,
    cache_ttl: Duration,
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        retry: RetryConfig,
        dimension: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            retry,
            dimension,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Wrap `provider` using the retry, dimension and cache settings of `config`
    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EngineConfig) -> Self {
        Self::new(
            provider,
            config.embedding_retry.clone(),
            config.embedding_dim,
            config.embedding_cache_ttl,
        )
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Embed `text`. Blank text yields `Ok(None)` and makes no outbound call.
    pub async fn embed(&self, text: &str) -> MemoryResult<Option<Vec<f32>>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let key = self.cache_key(text);
        if let Some(vector) = self.cached(&key).await {
            debug!("Embedding cache hit ({} chars)", text.len());
            return Ok(Some(vector));
        }

        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = calculate_delay(attempt - 1, &self.retry);
                debug!("Embedding retry attempt {} after {:?} delay", attempt, delay);
                sleep(delay).await;
            }

            match self.provider.embed(text).await {
                Ok(vector) => {
                    if vector.len() != self.dimension {
                        return Err(MemoryError::EmbeddingRejected(format!(
                            "Expected {} dimensions, got {}",
                            self.dimension,
                            vector.len()
                        )));
                    }
                    self.store(key, vector.clone()).await;
                    return Ok(Some(vector));
                }
                Err(ProviderError::Permanent(message)) => {
                    warn!("Embedding rejected (attempt {}): {}", attempt + 1, message);
                    return Err(MemoryError::EmbeddingRejected(message));
                }
                Err(ProviderError::RateLimited(message)) => {
                    warn!("Embedding rate limited (attempt {}): {}", attempt + 1, message);
                    if attempt + 1 < self.retry.max_attempts {
                        sleep(Duration::from_millis(self.retry.max_delay_ms)).await;
                    }
                    last_error = message;
                }
                Err(ProviderError::Transient(message)) => {
                    warn!("Embedding attempt {} failed: {}", attempt + 1, message);
                    last_error = message;
                }
            }
        }

        Err(MemoryError::EmbeddingUnavailable(format!(
            "Max attempts ({}) exceeded. Last error: {}",
            self.retry.max_attempts, last_error
        )))
    }

    /// Get cache statistics as (total, still valid)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().await;
        let valid = cache
            .values()
            .filter(|c| c.cached_at.elapsed() < self.cache_ttl)
            .count();
        (cache.len(), valid)
    }

    /// Clear the entire cache
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        debug!("Cleared {} cached embeddings", count);
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.model().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn cached(&self, key: &str) -> Option<Vec<f32>> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|c| c.cached_at.elapsed() < self.cache_ttl)
            .map(|c| c.vector.clone())
    }

    async fn store(&self, key: String, vector: Vec<f32>) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let mut cache = self.cache.write().await;
        let ttl = self.cache_ttl;
        cache.retain(|_, c| c.cached_at.elapsed() < ttl);
        // Evict oldest entry if cache is at capacity
        if cache.len() >= MAX_CACHE_SIZE {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, c)| c.cached_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
            }
        }
        cache.insert(
            key,
            CachedEmbedding {
                vector,
                cached_at: Instant::now(),
            },
        );
    }
}
