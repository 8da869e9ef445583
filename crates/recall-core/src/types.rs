// ============================================================================
// Shared Types - Error taxonomy for the memory engine
// ============================================================================

use uuid::Uuid;

/// Result alias used across the engine
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Error types for the memory engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    /// Transient embedding failure that survived every retry
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Permanent embedding failure (bad input, exhausted quota)
    #[error("Embedding rejected: {0}")]
    EmbeddingRejected(String),

    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl MemoryError {
    /// True for a missing conversation or message
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MemoryError::ConversationNotFound(_) | MemoryError::MessageNotFound(_)
        )
    }

    /// True for failures that degrade indexing/retrieval instead of aborting
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            MemoryError::EmbeddingUnavailable(_)
                | MemoryError::EmbeddingRejected(_)
                | MemoryError::IndexUnavailable(_)
        )
    }
}

/// Map a storage-layer failure into [`MemoryError::Storage`] with context
pub(crate) fn storage_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> MemoryError {
    move |e| MemoryError::Storage(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_grouping() {
        assert!(MemoryError::ConversationNotFound(Uuid::new_v4()).is_not_found());
        assert!(MemoryError::MessageNotFound(Uuid::new_v4()).is_not_found());
        assert!(!MemoryError::IndexUnavailable("down".into()).is_not_found());
    }

    #[test]
    fn test_degradable_errors() {
        assert!(MemoryError::EmbeddingUnavailable("timeout".into()).is_degradable());
        assert!(MemoryError::EmbeddingRejected("quota".into()).is_degradable());
        assert!(MemoryError::IndexUnavailable("refused".into()).is_degradable());
        assert!(!MemoryError::Storage("disk".into()).is_degradable());
    }

    #[test]
    fn test_storage_err_context() {
        let err = storage_err("Failed to begin write")("locked");
        assert_eq!(err.to_string(), "Storage error: Failed to begin write: locked");
    }
}
