//! ============================================================================
//! Memory Writer - Persist first, index best-effort
//! ============================================================================
//! A message counts as said once the store has it. Embedding and upserting
//! happen afterwards, inline or on a spawned task, and any failure there is
//! recorded as `failed` status for the reconciliation pass to pick up.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::embeddings::EmbeddingClient;
use super::store::VectorIndex;
use super::types::{MemoryVector, ReindexReport};
use crate::config::IndexingMode;
use crate::db::{ConversationDb, EmbeddingStatus, Message, Role};
use crate::types::{MemoryError, MemoryResult};

/// Write path for conversation messages
#[derive(Clone)]
pub struct MemoryWriter {
    db: Arc<ConversationDb>,
    embedder: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    mode: IndexingMode,
    grace_period: Duration,
}

impl MemoryWriter {
    pub fn new(
        db: Arc<ConversationDb>,
        embedder: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        mode: IndexingMode,
        grace_period: Duration,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            mode,
            grace_period,
        }
    }

    /// Record a message and schedule its indexing.
    ///
    /// Only store failures surface here. The returned message carries the
    /// status it was persisted with; in inline mode the indexing outcome is
    /// already applied to it.
    pub async fn append_message(
        &self,
        conversation_id: &Uuid,
        role: Role,
        text: &str,
    ) -> MemoryResult<Message> {
        let conversation = self.db.get_conversation(conversation_id)?;
        let mut message = self.db.append_message(conversation_id, role, text)?;

        debug!(
            "Appended message {} (seq {}) to conversation {}",
            message.id, message.seq, conversation_id
        );

        if message.is_blank() {
            return Ok(message);
        }

        match self.mode {
            IndexingMode::Inline => {
                match self.index_message(&message, &conversation.user_id).await {
                    Ok(status) => message.embedding_status = status,
                    Err(e) => warn!("Could not record indexing outcome for {}: {}", message.id, e),
                }
            }
            IndexingMode::Background => {
                let writer = self.clone();
                let pending = message.clone();
                let user_id = conversation.user_id;
                tokio::spawn(async move {
                    if let Err(e) = writer.index_message(&pending, &user_id).await {
                        warn!("Could not record indexing outcome for {}: {}", pending.id, e);
                    }
                });
            }
        }

        Ok(message)
    }

    /// Embed and upsert one message, then record the outcome as its status.
    ///
    /// Embedding and index outages become `failed` status. Anything else,
    /// including a failure to write that status, is returned as an error.
    pub async fn index_message(
        &self,
        message: &Message,
        user_id: &str,
    ) -> MemoryResult<EmbeddingStatus> {
        let vector = match self.embedder.embed(&message.content).await {
            Ok(Some(vector)) => vector,
            Ok(None) => return Ok(message.embedding_status),
            Err(e) => return self.record_failure(message, e),
        };

        let point = MemoryVector::for_message(message, user_id, vector);
        if let Err(e) = self.index.upsert(point).await {
            return self.record_failure(message, e);
        }

        self.db
            .mark_embedding_status(&message.id, EmbeddingStatus::Indexed)?;
        debug!("Indexed message {}", message.id);
        Ok(EmbeddingStatus::Indexed)
    }

    fn record_failure(
        &self,
        message: &Message,
        error: MemoryError,
    ) -> MemoryResult<EmbeddingStatus> {
        if !error.is_degradable() {
            return Err(error);
        }
        warn!("Indexing message {} failed: {}", message.id, error);
        self.db.mark_index_failure(&message.id)?;
        Ok(self.db.get_message(&message.id)?.embedding_status)
    }

    /// Retry indexing for up to `limit` messages still `pending` or `failed`
    /// that are older than the grace period. Messages that failed fewer times
    /// go first, so a message the provider keeps rejecting cannot hold the
    /// rest of the backlog back.
    pub async fn reindex_failed(&self, limit: usize) -> MemoryResult<ReindexReport> {
        let grace_ms = i64::try_from(self.grace_period.as_millis()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(grace_ms);
        let candidates = self.db.list_reindex_candidates(cutoff, limit)?;

        let mut report = ReindexReport {
            scanned: candidates.len(),
            ..ReindexReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        info!("Reindexing {} messages", candidates.len());

        for candidate in candidates {
            // A live write may have finished this one since the scan
            let current = match self.db.get_message(&candidate.id) {
                Ok(message) => message,
                Err(MemoryError::MessageNotFound(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if current.embedding_status == EmbeddingStatus::Indexed {
                report.skipped += 1;
                continue;
            }

            let conversation = self.db.get_conversation(&current.conversation_id)?;
            match self.index_message(&current, &conversation.user_id).await? {
                EmbeddingStatus::Indexed => report.indexed += 1,
                _ => report.failed += 1,
            }
        }

        info!(
            "Reindex pass: {} scanned, {} indexed, {} failed, {} skipped",
            report.scanned, report.indexed, report.failed, report.skipped
        );
        Ok(report)
    }
}
