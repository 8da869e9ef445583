//! ============================================================================
//! Memory Manager - Orchestrates conversation memory
//! ============================================================================
//! High-level API for recording messages, assembling context windows and
//! running reconciliation. Owns the store, embedder and index handles.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::context::{ContextAssembler, ScoringPolicy, TokenEstimator};
use super::embeddings::{EmbeddingClient, EmbeddingProvider, OpenAiEmbeddings};
use super::store::{QdrantIndex, VectorIndex};
use super::types::{ContextWindow, ReindexReport};
use super::writer::MemoryWriter;
use crate::config::EngineConfig;
use crate::db::{Conversation, ConversationDb, DbStats, Message, Role};
use crate::types::MemoryResult;

/// Store and index figures reported by [`MemoryManager::stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub db: DbStats,
    /// None when the index could not be reached
    pub indexed_vectors: Option<u64>,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub cached_embeddings: usize,
}

/// Reachability of each dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub store: bool,
    pub index: bool,
}

/// Memory manager combining store, embeddings and vector index
pub struct MemoryManager {
    config: EngineConfig,
    db: Arc<ConversationDb>,
    embedder: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    writer: MemoryWriter,
    assembler: ContextAssembler,
}

impl MemoryManager {
    /// Wire a manager from already-built collaborators
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        db: Arc<ConversationDb>,
    ) -> MemoryResult<Self> {
        config.validate()?;

        let embedder = Arc::new(EmbeddingClient::from_config(provider, &config));
        let writer = MemoryWriter::new(
            db.clone(),
            embedder.clone(),
            index.clone(),
            config.indexing_mode,
            config.reindex_grace_period,
        );
        let assembler = ContextAssembler::new(db.clone(), embedder.clone(), index.clone(), &config);

        Ok(Self {
            config,
            db,
            embedder,
            index,
            writer,
            assembler,
        })
    }

    /// Build the production stack: OpenAI-compatible embeddings, Qdrant and
    /// the on-disk store
    pub async fn from_config(config: EngineConfig) -> MemoryResult<Self> {
        let provider = Arc::new(OpenAiEmbeddings::from_config(&config)?);
        let index = Arc::new(QdrantIndex::from_config(&config).await?);
        let db = Arc::new(ConversationDb::open(config.db_path.as_deref())?);

        info!(
            "Memory manager ready (model {}, collection {})",
            config.embedding_model,
            index.collection()
        );

        Self::new(config, provider, index, db)
    }

    /// Replace the ranking policy used for context assembly
    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPolicy>) -> Self {
        self.assembler = self.assembler.with_scoring(scoring);
        self
    }

    /// Replace the size estimator used for context assembly
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.assembler = self.assembler.with_estimator(estimator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<ConversationDb> {
        &self.db
    }

    pub fn start_conversation(&self, user_id: &str) -> MemoryResult<Conversation> {
        let conversation = self.db.create_conversation(user_id)?;
        info!("Started conversation {} for user {}", conversation.id, user_id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &Uuid) -> MemoryResult<Conversation> {
        self.db.get_conversation(conversation_id)
    }

    /// Record a message. Succeeds whenever the store accepts it.
    pub async fn append_message(
        &self,
        conversation_id: &Uuid,
        role: Role,
        text: &str,
    ) -> MemoryResult<Message> {
        self.writer.append_message(conversation_id, role, text).await
    }

    /// Up to `limit` newest messages, oldest first
    pub fn recent(&self, conversation_id: &Uuid, limit: usize) -> MemoryResult<Vec<Message>> {
        self.db.get_recent(conversation_id, limit)
    }

    /// Retry indexing for messages left `pending` or `failed`
    pub async fn reindex_failed(&self, limit: usize) -> MemoryResult<ReindexReport> {
        self.writer.reindex_failed(limit).await
    }

    /// Assemble context for `incoming_text`. `budget` defaults to the
    /// configured context budget.
    pub async fn assemble_context(
        &self,
        conversation_id: &Uuid,
        incoming_text: &str,
        budget: Option<usize>,
    ) -> MemoryResult<ContextWindow> {
        let budget = budget.unwrap_or(self.config.context_token_budget);
        self.assembler
            .assemble(conversation_id, incoming_text, budget)
            .await
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            store: self.db.stats().is_ok(),
            index: self.index.health_check().await.unwrap_or(false),
        }
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let db = self.db.stats()?;
        let indexed_vectors = self.index.count().await.ok();
        let (cached_embeddings, _) = self.embedder.cache_stats().await;

        Ok(MemoryStats {
            db,
            indexed_vectors,
            embedding_model: self.embedder.model().to_string(),
            embedding_dim: self.embedder.dimension(),
            cached_embeddings,
        })
    }
}
