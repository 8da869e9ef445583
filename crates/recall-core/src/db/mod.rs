// ============================================================================
// ConversationDb — Embedded Database (redb)
// ============================================================================
// Store of record for conversations and messages.
// Default path: ~/.recall/conversations.redb (override via RECALL_DB_PATH)
//
// Tables:
//   conversations          conversation id -> bincode(Conversation)
//   messages               message id      -> bincode(Message)
//   conversation_timeline  "{conversation id}:{seq:020}" -> message id
//   reindex_queue          "{attempts:010}:{created_at:020}:{seq:020}:{id}" -> message id
//   status_counts          embedding status -> message count
//
// The queue holds exactly the non-blank messages that still need indexing,
// fewest failed attempts first. Queue and counts change in the same write
// transaction as the message they describe.
//
// Every append runs in a single write transaction; redb serializes writers,
// which makes the append the linearization point for message order.
// ============================================================================

pub mod types;

pub use types::{Conversation, DbStats, EmbeddingStatus, Message, Role};

use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{storage_err, MemoryError, MemoryResult};

// Table definitions
const CONVERSATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const TIMELINE: TableDefinition<&str, &str> = TableDefinition::new("conversation_timeline");
const REINDEX_QUEUE: TableDefinition<&str, &str> = TableDefinition::new("reindex_queue");
const STATUS_COUNTS: TableDefinition<&str, u64> = TableDefinition::new("status_counts");

/// Embedded database holding conversations and their messages
pub struct ConversationDb {
    db: Database,
    path: Option<PathBuf>,
}

impl ConversationDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ~/.recall/conversations.redb
    pub fn open(path: Option<&Path>) -> MemoryResult<Self> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    MemoryError::Storage("Cannot determine home directory".to_string())
                })?;
                home.join(".recall").join("conversations.redb")
            }
        };

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(storage_err("Failed to create database directory"))?;
        }

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(storage_err("Failed to open database"))?;
        Self::init(db, Some(db_path))
    }

    /// Create a throwaway database that lives only in memory
    pub fn in_memory() -> MemoryResult<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage_err("Failed to create in-memory database"))?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> MemoryResult<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write().map_err(storage_err("Failed to begin write"))?;
        {
            write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage_err("Failed to create conversations table"))?;
            write_txn
                .open_table(MESSAGES)
                .map_err(storage_err("Failed to create messages table"))?;
            write_txn
                .open_table(TIMELINE)
                .map_err(storage_err("Failed to create timeline table"))?;
            write_txn
                .open_table(REINDEX_QUEUE)
                .map_err(storage_err("Failed to create reindex queue table"))?;
            write_txn
                .open_table(STATUS_COUNTS)
                .map_err(storage_err("Failed to create status counts table"))?;
        }
        write_txn.commit().map_err(storage_err("Failed to commit init"))?;

        debug!("Database ready");
        Ok(Self { db, path })
    }

    /// Get the database file path (None for in-memory databases)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    pub fn create_conversation(&self, user_id: &str) -> MemoryResult<Conversation> {
        let now = chrono::Utc::now().timestamp_millis();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity_at: now,
            message_count: 0,
        };
        let key = conversation.id.to_string();
        let value = encode(&conversation, "conversation")?;

        let write_txn = self.db.begin_write().map_err(storage_err("Failed to begin write"))?;
        {
            let mut table = write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage_err("Failed to open conversations table"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(storage_err("Failed to insert conversation"))?;
        }
        write_txn.commit().map_err(storage_err("Failed to commit"))?;

        info!("Created conversation {} for user {}", conversation.id, user_id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &Uuid) -> MemoryResult<Conversation> {
        let key = conversation_id.to_string();

        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage_err("Failed to open conversations table"))?;

        match table
            .get(key.as_str())
            .map_err(storage_err("Failed to get conversation"))?
        {
            Some(value) => decode(value.value(), "conversation"),
            None => Err(MemoryError::ConversationNotFound(*conversation_id)),
        }
    }

    /// List conversations, optionally restricted to one user
    pub fn list_conversations(&self, user_id: Option<&str>) -> MemoryResult<Vec<Conversation>> {
        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage_err("Failed to open conversations table"))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(storage_err("Failed to iterate conversations"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage_err("Failed to read entry"))?;
            let conversation: Conversation = decode(value.value(), "conversation")?;
            if user_id.map_or(true, |u| u == conversation.user_id) {
                results.push(conversation);
            }
        }
        results.sort_by_key(|c| (c.created_at, c.id));
        Ok(results)
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Persist a new message with status `pending` and bump the conversation.
    pub fn append_message(
        &self,
        conversation_id: &Uuid,
        role: Role,
        content: &str,
    ) -> MemoryResult<Message> {
        let conversation_key = conversation_id.to_string();

        let write_txn = self.db.begin_write().map_err(storage_err("Failed to begin write"))?;
        let message;
        {
            let mut conversations = write_txn
                .open_table(CONVERSATIONS)
                .map_err(storage_err("Failed to open conversations table"))?;
            let existing = conversations
                .get(conversation_key.as_str())
                .map_err(storage_err("Failed to get conversation"))?
                .map(|v| v.value().to_vec());
            let Some(bytes) = existing else {
                return Err(MemoryError::ConversationNotFound(*conversation_id));
            };
            let mut conversation: Conversation = decode(&bytes, "conversation")?;

            // Clock skew must never reorder a conversation
            let now = chrono::Utc::now()
                .timestamp_millis()
                .max(conversation.last_activity_at);
            conversation.message_count += 1;
            conversation.last_activity_at = now;

            message = Message {
                id: Uuid::new_v4(),
                conversation_id: *conversation_id,
                seq: conversation.message_count,
                role,
                content: content.to_string(),
                created_at: now,
                embedding_status: EmbeddingStatus::Pending,
                status_updated_at: now,
                index_attempts: 0,
            };

            let message_key = message.id.to_string();
            let mut messages = write_txn
                .open_table(MESSAGES)
                .map_err(storage_err("Failed to open messages table"))?;
            messages
                .insert(message_key.as_str(), encode(&message, "message")?.as_slice())
                .map_err(storage_err("Failed to insert message"))?;

            let mut timeline = write_txn
                .open_table(TIMELINE)
                .map_err(storage_err("Failed to open timeline table"))?;
            timeline
                .insert(
                    timeline_key(conversation_id, message.seq).as_str(),
                    message_key.as_str(),
                )
                .map_err(storage_err("Failed to insert timeline entry"))?;

            if is_queued(&message) {
                let mut queue = write_txn
                    .open_table(REINDEX_QUEUE)
                    .map_err(storage_err("Failed to open reindex queue table"))?;
                queue
                    .insert(queue_key(&message).as_str(), message_key.as_str())
                    .map_err(storage_err("Failed to enqueue message"))?;
            }
            let mut counts = write_txn
                .open_table(STATUS_COUNTS)
                .map_err(storage_err("Failed to open status counts table"))?;
            adjust_status_count(&mut counts, message.embedding_status, 1)?;

            conversations
                .insert(
                    conversation_key.as_str(),
                    encode(&conversation, "conversation")?.as_slice(),
                )
                .map_err(storage_err("Failed to update conversation"))?;
        }
        write_txn.commit().map_err(storage_err("Failed to commit"))?;

        debug!(
            "Appended message {} (seq {}) to conversation {}",
            message.id, message.seq, conversation_id
        );
        Ok(message)
    }

    pub fn get_message(&self, message_id: &Uuid) -> MemoryResult<Message> {
        let key = message_id.to_string();

        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let table = read_txn
            .open_table(MESSAGES)
            .map_err(storage_err("Failed to open messages table"))?;

        match table.get(key.as_str()).map_err(storage_err("Failed to get message"))? {
            Some(value) => decode(value.value(), "message"),
            None => Err(MemoryError::MessageNotFound(*message_id)),
        }
    }

    /// Up to `limit` most recent messages, returned oldest-first.
    pub fn get_recent(&self, conversation_id: &Uuid, limit: usize) -> MemoryResult<Vec<Message>> {
        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let conversations = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage_err("Failed to open conversations table"))?;
        if conversations
            .get(conversation_id.to_string().as_str())
            .map_err(storage_err("Failed to get conversation"))?
            .is_none()
        {
            return Err(MemoryError::ConversationNotFound(*conversation_id));
        }

        let timeline = read_txn
            .open_table(TIMELINE)
            .map_err(storage_err("Failed to open timeline table"))?;
        let messages = read_txn
            .open_table(MESSAGES)
            .map_err(storage_err("Failed to open messages table"))?;

        let (start, end) = timeline_bounds(conversation_id);
        let iter = timeline
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(storage_err("Failed to iterate timeline"))?;

        let mut recent = Vec::new();
        for entry in iter.rev().take(limit) {
            let (_key, value) = entry.map_err(storage_err("Failed to read timeline entry"))?;
            let message_key = value.value().to_string();
            let stored = messages
                .get(message_key.as_str())
                .map_err(storage_err("Failed to get message"))?
                .ok_or_else(|| {
                    MemoryError::Storage(format!("Dangling timeline entry for {}", message_key))
                })?;
            recent.push(decode::<Message>(stored.value(), "message")?);
        }
        recent.reverse();
        Ok(recent)
    }

    /// Every message of a conversation, oldest-first
    pub fn list_messages(&self, conversation_id: &Uuid) -> MemoryResult<Vec<Message>> {
        self.get_recent(conversation_id, usize::MAX)
    }

    /// Set the embedding status. Returns false when it already had that status.
    pub fn mark_embedding_status(
        &self,
        message_id: &Uuid,
        status: EmbeddingStatus,
    ) -> MemoryResult<bool> {
        self.update_embedding_status(message_id, status, false)
    }

    /// Record a failed indexing attempt and push the message behind messages
    /// with fewer failures. A message that another writer already indexed
    /// keeps its `indexed` status. Returns true when the status changed.
    pub fn mark_index_failure(&self, message_id: &Uuid) -> MemoryResult<bool> {
        self.update_embedding_status(message_id, EmbeddingStatus::Failed, true)
    }

    fn update_embedding_status(
        &self,
        message_id: &Uuid,
        status: EmbeddingStatus,
        failed_attempt: bool,
    ) -> MemoryResult<bool> {
        let key = message_id.to_string();

        let write_txn = self.db.begin_write().map_err(storage_err("Failed to begin write"))?;
        let changed;
        {
            let mut table = write_txn
                .open_table(MESSAGES)
                .map_err(storage_err("Failed to open messages table"))?;
            let existing = table
                .get(key.as_str())
                .map_err(storage_err("Failed to get message"))?
                .map(|v| v.value().to_vec());
            let Some(bytes) = existing else {
                return Err(MemoryError::MessageNotFound(*message_id));
            };
            let previous: Message = decode(&bytes, "message")?;
            let mut message = previous.clone();
            let now = chrono::Utc::now().timestamp_millis();

            if failed_attempt {
                if message.embedding_status != EmbeddingStatus::Indexed {
                    message.embedding_status = status;
                    message.index_attempts = message.index_attempts.saturating_add(1);
                    message.status_updated_at = now;
                }
            } else if message.embedding_status != status {
                message.embedding_status = status;
                message.status_updated_at = now;
            }
            changed = message.embedding_status != previous.embedding_status;

            if message != previous {
                table
                    .insert(key.as_str(), encode(&message, "message")?.as_slice())
                    .map_err(storage_err("Failed to update message"))?;

                let mut queue = write_txn
                    .open_table(REINDEX_QUEUE)
                    .map_err(storage_err("Failed to open reindex queue table"))?;
                if is_queued(&previous) {
                    queue
                        .remove(queue_key(&previous).as_str())
                        .map_err(storage_err("Failed to dequeue message"))?;
                }
                if is_queued(&message) {
                    queue
                        .insert(queue_key(&message).as_str(), key.as_str())
                        .map_err(storage_err("Failed to enqueue message"))?;
                }
            }
            if changed {
                let mut counts = write_txn
                    .open_table(STATUS_COUNTS)
                    .map_err(storage_err("Failed to open status counts table"))?;
                adjust_status_count(&mut counts, previous.embedding_status, -1)?;
                adjust_status_count(&mut counts, message.embedding_status, 1)?;
            }
        }
        write_txn.commit().map_err(storage_err("Failed to commit"))?;

        if changed {
            debug!("Updated message {} embedding status to {}", message_id, status);
        }
        Ok(changed)
    }

    /// Hydrate messages by id. Fails if any id is unknown.
    pub fn get_by_ids(&self, ids: &[Uuid]) -> MemoryResult<HashMap<Uuid, Message>> {
        let found = self.find_by_ids(ids)?;
        if let Some(missing) = ids.iter().find(|id| !found.contains_key(id)) {
            return Err(MemoryError::MessageNotFound(*missing));
        }
        Ok(found)
    }

    /// Hydrate messages by id, silently skipping unknown ids.
    pub fn find_by_ids(&self, ids: &[Uuid]) -> MemoryResult<HashMap<Uuid, Message>> {
        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let table = read_txn
            .open_table(MESSAGES)
            .map_err(storage_err("Failed to open messages table"))?;

        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            let key = id.to_string();
            if let Some(value) = table
                .get(key.as_str())
                .map_err(storage_err("Failed to get message"))?
            {
                found.insert(*id, decode::<Message>(value.value(), "message")?);
            }
        }
        Ok(found)
    }

    /// Non-blank messages still `pending` or `failed` and created at or before
    /// `cutoff_ms`. Fewest failed attempts first, then oldest.
    pub fn list_reindex_candidates(&self, cutoff_ms: i64, limit: usize) -> MemoryResult<Vec<Message>> {
        let mut candidates = Vec::new();
        if limit == 0 {
            return Ok(candidates);
        }

        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let queue = read_txn
            .open_table(REINDEX_QUEUE)
            .map_err(storage_err("Failed to open reindex queue table"))?;
        let messages = read_txn
            .open_table(MESSAGES)
            .map_err(storage_err("Failed to open messages table"))?;

        let iter = queue
            .range::<&str>(..)
            .map_err(storage_err("Failed to iterate reindex queue"))?;
        for entry in iter {
            let (_key, value) = entry.map_err(storage_err("Failed to read queue entry"))?;
            let message_key = value.value().to_string();
            let stored = messages
                .get(message_key.as_str())
                .map_err(storage_err("Failed to get message"))?
                .ok_or_else(|| {
                    MemoryError::Storage(format!("Dangling queue entry for {}", message_key))
                })?;
            let message: Message = decode(stored.value(), "message")?;
            if message.created_at > cutoff_ms {
                continue;
            }
            candidates.push(message);
            if candidates.len() >= limit {
                break;
            }
        }
        Ok(candidates)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> MemoryResult<DbStats> {
        let read_txn = self.db.begin_read().map_err(storage_err("Failed to begin read"))?;
        let conversations = read_txn
            .open_table(CONVERSATIONS)
            .map_err(storage_err("Failed to open conversations table"))?;
        let messages = read_txn
            .open_table(MESSAGES)
            .map_err(storage_err("Failed to open messages table"))?;
        let counts = read_txn
            .open_table(STATUS_COUNTS)
            .map_err(storage_err("Failed to open status counts table"))?;

        let mut stats = DbStats {
            total_conversations: conversations
                .len()
                .map_err(storage_err("Failed to count conversations"))? as usize,
            total_messages: messages
                .len()
                .map_err(storage_err("Failed to count messages"))? as usize,
            ..DbStats::default()
        };
        let iter = counts
            .range::<&str>(..)
            .map_err(storage_err("Failed to iterate status counts"))?;
        for entry in iter {
            let (status, count) = entry.map_err(storage_err("Failed to read entry"))?;
            if count.value() > 0 {
                stats
                    .status_counts
                    .insert(status.value().to_string(), count.value() as usize);
            }
        }
        Ok(stats)
    }
}

/// Whether reconciliation should still pick the message up
fn is_queued(message: &Message) -> bool {
    message.embedding_status.needs_reindex() && !message.is_blank()
}

fn queue_key(message: &Message) -> String {
    format!(
        "{:010}:{:020}:{:020}:{}",
        message.index_attempts,
        message.created_at.max(0),
        message.seq,
        message.id
    )
}

fn adjust_status_count(
    counts: &mut Table<'_, &'static str, u64>,
    status: EmbeddingStatus,
    delta: i64,
) -> MemoryResult<()> {
    let current = counts
        .get(status.as_str())
        .map_err(storage_err("Failed to get status count"))?
        .map(|v| v.value())
        .unwrap_or(0);
    let next = if delta < 0 {
        current.saturating_sub(delta.unsigned_abs())
    } else {
        current.saturating_add(delta as u64)
    };
    counts
        .insert(status.as_str(), next)
        .map_err(storage_err("Failed to update status count"))?;
    Ok(())
}

fn timeline_key(conversation_id: &Uuid, seq: u64) -> String {
    format!("{}:{:020}", conversation_id, seq)
}

/// Half-open key range covering one conversation's timeline (';' follows ':')
fn timeline_bounds(conversation_id: &Uuid) -> (String, String) {
    (format!("{}:", conversation_id), format!("{};", conversation_id))
}

fn encode<T: Serialize>(value: &T, what: &str) -> MemoryResult<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| MemoryError::Storage(format!("Failed to serialize {}: {}", what, e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> MemoryResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| MemoryError::Storage(format!("Failed to deserialize {}: {}", what, e)))
}
