//! ============================================================================
//! RECALL-CORE: Conversation Memory & Context Retrieval
//! ============================================================================
//! This crate handles everything between a chat turn and the completion call:
//! - Durable conversation/message records in an embedded redb database
//! - Text embeddings via an OpenAI-compatible API, with retry and caching
//! - Semantic index in Qdrant, isolated per user
//! - Budgeted context windows blending recent and retrieved turns
//! ============================================================================

pub mod config;
pub mod db;
pub mod memory;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use config::{EngineConfig, IndexingMode, RetrievalScope};
pub use db::{ConversationDb, Conversation, DbStats, EmbeddingStatus, Message, Role};
pub use memory::{ContextWindow, MemoryManager, ReindexReport};
pub use types::{MemoryError, MemoryResult};
