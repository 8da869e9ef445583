//! ============================================================================
//! Memory Module - Conversation memory and context retrieval
//! ============================================================================
//! Every message is written to the embedded store first; its embedding is a
//! best-effort projection into a per-user Qdrant index. Context assembly
//! blends the most recent turns with semantically recalled older ones under
//! a size budget.
//!
//! ## Architecture
//! ```text
//! append_message → ConversationDb (pending) → Embed → Qdrant upsert → indexed
//!                                                 ↘ failure → failed
//!                                                          ↓
//!                                                  reindex_failed
//!
//! assemble_context → recent R ─┐
//!                  → Embed → top K (same user, minus recent) ─┤
//!                                                   greedy budget fill
//!                                                          ↓
//!                                              chronological ContextWindow
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use recall_core::{EngineConfig, MemoryManager, Role};
//!
//! let manager = MemoryManager::from_config(EngineConfig::from_env()?).await?;
//! let conversation = manager.start_conversation("user-42")?;
//! manager.append_message(&conversation.id, Role::User, "I love hiking").await?;
//!
//! let window = manager
//!     .assemble_context(&conversation.id, "Any trail ideas?", None)
//!     .await?;
//! let prompt_block = window.format_for_prompt();
//! ```
//! ============================================================================

pub(crate) mod context;
pub(crate) mod embeddings;
mod manager;
pub(crate) mod store;
pub(crate) mod types;
pub(crate) mod writer;

// Re-export public types
pub use context::{CharRatioEstimator, ContextAssembler, RecencyDecay, ScoringPolicy, TokenEstimator};
pub use embeddings::{EmbeddingClient, EmbeddingProvider, OpenAiEmbeddings, ProviderError};
pub use manager::{HealthReport, MemoryManager, MemoryStats};
pub use store::{cosine_similarity, InMemoryIndex, QdrantIndex, VectorIndex};
pub use types::{
    ContextItem, ContextWindow, MemoryVector, ReindexReport, ScoredMessage, SelectionReason,
    VectorPayload, VectorQuery,
};
pub use writer::MemoryWriter;
