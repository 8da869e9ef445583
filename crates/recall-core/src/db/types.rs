//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A conversation owned by one user.
/// Never deleted here; only touched by appending messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis of the latest appended message
    pub last_activity_at: i64,
    /// Messages appended so far; also the last assigned sequence number
    pub message_count: u64,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Where a message stands with respect to the vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Pending,
    Indexed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Indexed => "indexed",
            EmbeddingStatus::Failed => "failed",
        }
    }

    /// Pending and failed messages are picked up by reconciliation
    pub fn needs_reindex(&self) -> bool {
        !matches!(self, EmbeddingStatus::Indexed)
    }
}

impl std::fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmbeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EmbeddingStatus::Pending),
            "indexed" => Ok(EmbeddingStatus::Indexed),
            "failed" => Ok(EmbeddingStatus::Failed),
            _ => Err(format!("Unknown embedding status: {}", s)),
        }
    }
}

/// A single chat turn. Immutable apart from its embedding status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// 1-based position within the conversation, the insertion-order tiebreak
    pub seq: u64,
    pub role: Role,
    pub content: String,
    /// Unix millis, non-decreasing within a conversation
    pub created_at: i64,
    pub embedding_status: EmbeddingStatus,
    /// Unix millis of the last status transition or failed attempt
    pub status_updated_at: i64,
    /// Indexing attempts that ended in failure
    pub index_attempts: u32,
}

impl Message {
    /// Blank messages are stored but never embedded
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    /// Message counts keyed by embedding status
    pub status_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_status_reindex_eligibility() {
        assert!(EmbeddingStatus::Pending.needs_reindex());
        assert!(EmbeddingStatus::Failed.needs_reindex());
        assert!(!EmbeddingStatus::Indexed.needs_reindex());
        assert_eq!("FAILED".parse::<EmbeddingStatus>().unwrap(), EmbeddingStatus::Failed);
    }

    #[test]
    fn test_message_bincode_roundtrip() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            seq: 7,
            role: Role::Assistant,
            content: "Try the ridge trail".to_string(),
            created_at: 1_700_000_000_000,
            embedding_status: EmbeddingStatus::Pending,
            status_updated_at: 1_700_000_000_000,
            index_attempts: 0,
        };
        let bytes = bincode::serialize(&message).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, message);
    }
}
