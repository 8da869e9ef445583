// Deterministic fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::memory::embeddings::{EmbeddingProvider, ProviderError};
use crate::memory::store::VectorIndex;
use crate::memory::types::{MemoryVector, ScoredMessage, VectorQuery};
use crate::types::{MemoryError, MemoryResult};

pub const TEST_DIM: usize = 64;

/// Bag-of-words embedder: each distinct lowercase word gets its own axis,
/// so cosine similarity reflects shared vocabulary exactly.
pub struct VocabularyEmbedder {
    vocabulary: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl VocabularyEmbedder {
    pub fn new() -> Self {
        Self {
            vocabulary: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; TEST_DIM];
        let mut vocabulary = self.vocabulary.lock().unwrap();
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            let next = vocabulary.len();
            let axis = *vocabulary.entry(word).or_insert(next) % TEST_DIM;
            vector[axis] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vectorize(text))
    }

    fn model(&self) -> &str {
        "vocabulary-test"
    }
}

/// Always fails with the same error
pub struct FailingEmbedder {
    error: ProviderError,
    calls: AtomicUsize,
}

impl FailingEmbedder {
    fn with(error: ProviderError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn transient() -> Self {
        Self::with(ProviderError::Transient("connection reset".to_string()))
    }

    pub fn rate_limited() -> Self {
        Self::with(ProviderError::RateLimited("429 Too Many Requests".to_string()))
    }

    pub fn permanent() -> Self {
        Self::with(ProviderError::Permanent("invalid input".to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    fn model(&self) -> &str {
        "failing-test"
    }
}

/// Fails transiently a fixed number of times, then behaves like
/// [`VocabularyEmbedder`]
pub struct FlakyEmbedder {
    failures_left: AtomicUsize,
    inner: VocabularyEmbedder,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            inner: VocabularyEmbedder::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::Transient("503 Service Unavailable".to_string()));
        }
        self.inner.embed(text).await
    }

    fn model(&self) -> &str {
        "flaky-test"
    }
}

/// Embedder that can be switched between outage and healthy
pub struct ToggleEmbedder {
    healthy: AtomicBool,
    inner: VocabularyEmbedder,
}

impl ToggleEmbedder {
    pub fn down() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            inner: VocabularyEmbedder::new(),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for ToggleEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("connection refused".to_string()));
        }
        self.inner.embed(text).await
    }

    fn model(&self) -> &str {
        "toggle-test"
    }
}

/// Permanently rejects any text containing a marker word and embeds the
/// rest like [`VocabularyEmbedder`]
pub struct RejectingEmbedder {
    marker: String,
    inner: VocabularyEmbedder,
}

impl RejectingEmbedder {
    pub fn containing(marker: &str) -> Self {
        Self {
            marker: marker.to_lowercase(),
            inner: VocabularyEmbedder::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RejectingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.to_lowercase().contains(&self.marker) {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::Permanent("input too long".to_string()));
        }
        self.inner.embed(text).await
    }

    fn model(&self) -> &str {
        "rejecting-test"
    }
}

/// Vector index that is never reachable
pub struct UnreachableIndex;

#[async_trait]
impl VectorIndex for UnreachableIndex {
    async fn upsert(&self, _vector: MemoryVector) -> MemoryResult<()> {
        Err(MemoryError::IndexUnavailable("connection refused".to_string()))
    }

    async fn query(&self, _query: &VectorQuery) -> MemoryResult<Vec<ScoredMessage>> {
        Err(MemoryError::IndexUnavailable("connection refused".to_string()))
    }

    async fn count(&self) -> MemoryResult<u64> {
        Err(MemoryError::IndexUnavailable("connection refused".to_string()))
    }

    async fn health_check(&self) -> MemoryResult<bool> {
        Ok(false)
    }
}
