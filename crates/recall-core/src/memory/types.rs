//! ============================================================================
//! Memory Types - Vectors, queries, and assembled context windows
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::db::{Message, Role};

/// Payload stored alongside every vector in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub role: Role,
    /// Unix millis, copied from the message
    pub created_at: i64,
}

/// Index-side projection of exactly one message, keyed by the message id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryVector {
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

impl MemoryVector {
    /// Build the projection of `message` owned by `user_id`
    pub fn for_message(message: &Message, user_id: &str, vector: Vec<f32>) -> Self {
        Self {
            vector,
            payload: VectorPayload {
                message_id: message.id,
                conversation_id: message.conversation_id,
                user_id: user_id.to_string(),
                role: message.role,
                created_at: message.created_at,
            },
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.payload.message_id
    }
}

/// Nearest-neighbour request. `user_id` is mandatory; everything else narrows.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub user_id: String,
    pub top_k: usize,
    pub exclude_ids: HashSet<Uuid>,
    /// Restrict to one conversation in addition to the user
    pub conversation_id: Option<Uuid>,
    /// Drop hits scoring below this similarity
    pub min_score: Option<f32>,
}

impl VectorQuery {
    pub fn new(vector: Vec<f32>, user_id: impl Into<String>, top_k: usize) -> Self {
        Self {
            vector,
            user_id: user_id.into(),
            top_k,
            exclude_ids: HashSet::new(),
            conversation_id: None,
            min_score: None,
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// One index hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredMessage {
    pub message_id: Uuid,
    /// Cosine similarity as reported by the index
    pub similarity: f32,
}

/// Why a message made it into the context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Recent,
    Retrieved,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::Recent => "recent",
            SelectionReason::Retrieved => "retrieved",
        }
    }
}

/// A message selected for the context window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub message: Message,
    pub reason: SelectionReason,
    /// Normalized score in [0, 1] used for ranking
    pub score: f32,
    /// Estimated size in budget units
    pub estimated_tokens: usize,
}

/// Bounded, chronologically ordered context for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    pub conversation_id: Uuid,
    pub items: Vec<ContextItem>,
    pub budget: usize,
    pub total_tokens: usize,
    /// Semantic retrieval was skipped because embedding or the index failed
    pub retrieval_degraded: bool,
}

impl ContextWindow {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn message_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.message.id).collect()
    }

    pub fn retrieved(&self) -> impl Iterator<Item = &ContextItem> {
        self.items
            .iter()
            .filter(|item| item.reason == SelectionReason::Retrieved)
    }

    /// Render the window as a transcript block for a completion prompt
    pub fn format_for_prompt(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }

        let mut formatted = String::from("\n<conversation_memory>\n");

        for item in &self.items {
            let role_label = match item.message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            match item.reason {
                SelectionReason::Recent => {
                    formatted.push_str(&format!("{}: {}\n", role_label, item.message.content));
                }
                SelectionReason::Retrieved => {
                    formatted.push_str(&format!(
                        "[From earlier] {}: {}\n",
                        role_label, item.message.content
                    ));
                }
            }
        }

        formatted.push_str("</conversation_memory>\n");
        formatted
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexReport {
    /// Candidates examined
    pub scanned: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Candidates that turned `indexed` before this pass reached them
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EmbeddingStatus;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            seq: 1,
            role,
            content: content.to_string(),
            created_at: 0,
            embedding_status: EmbeddingStatus::Indexed,
            status_updated_at: 0,
            index_attempts: 0,
        }
    }

    #[test]
    fn test_query_builder() {
        let skip = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let query = VectorQuery::new(vec![1.0], "user-a", 5)
            .excluding([skip])
            .in_conversation(conversation)
            .with_min_score(0.5);

        assert!(query.exclude_ids.contains(&skip));
        assert_eq!(query.conversation_id, Some(conversation));
        assert_eq!(query.min_score, Some(0.5));
        assert_eq!(query.top_k, 5);
    }

    #[test]
    fn test_vector_for_message_copies_ids() {
        let msg = message(Role::User, "hello");
        let vector = MemoryVector::for_message(&msg, "user-a", vec![0.1, 0.2]);
        assert_eq!(vector.message_id(), msg.id);
        assert_eq!(vector.payload.conversation_id, msg.conversation_id);
        assert_eq!(vector.payload.user_id, "user-a");
        assert_eq!(vector.payload.role, Role::User);
    }

    #[test]
    fn test_prompt_formatting_labels_retrieved() {
        let window = ContextWindow {
            conversation_id: Uuid::new_v4(),
            items: vec![
                ContextItem {
                    message: message(Role::User, "I love hiking"),
                    reason: SelectionReason::Retrieved,
                    score: 0.8,
                    estimated_tokens: 8,
                },
                ContextItem {
                    message: message(Role::Assistant, "Sunny today"),
                    reason: SelectionReason::Recent,
                    score: 1.0,
                    estimated_tokens: 7,
                },
            ],
            budget: 100,
            total_tokens: 15,
            retrieval_degraded: false,
        };

        let formatted = window.format_for_prompt();
        assert!(formatted.contains("[From earlier] User: I love hiking"));
        assert!(formatted.contains("Assistant: Sunny today"));
        assert_eq!(window.retrieved().count(), 1);
    }
}
