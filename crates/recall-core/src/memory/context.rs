//! ============================================================================
//! Context Assembler - Budgeted mix of recent and recalled messages
//! ============================================================================
//! Read-only. Recent messages always compete for the budget; semantic recall
//! joins them when the embedder and index cooperate and is skipped otherwise.
//! ============================================================================

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::embeddings::EmbeddingClient;
use super::store::VectorIndex;
use super::types::{ContextItem, ContextWindow, ScoredMessage, SelectionReason, VectorQuery};
use crate::config::{EngineConfig, RetrievalScope};
use crate::db::{Conversation, ConversationDb, EmbeddingStatus, Message};
use crate::types::{MemoryError, MemoryResult};

/// Maps raw signals onto the shared `[0, 1]` ranking scale
pub trait ScoringPolicy: Send + Sync {
    /// `position` counts back from the newest recent message (newest = 0)
    fn recency_score(&self, position: usize) -> f32;

    fn similarity_score(&self, similarity: f32) -> f32;
}

/// Recency halves every `half_life` positions; similarity is clamped cosine
#[derive(Debug, Clone, Copy)]
pub struct RecencyDecay {
    pub half_life: f32,
}

impl Default for RecencyDecay {
    fn default() -> Self {
        Self { half_life: 5.0 }
    }
}

impl ScoringPolicy for RecencyDecay {
    fn recency_score(&self, position: usize) -> f32 {
        if self.half_life <= 0.0 {
            return if position == 0 { 1.0 } else { 0.0 };
        }
        0.5f32.powf(position as f32 / self.half_life)
    }

    fn similarity_score(&self, similarity: f32) -> f32 {
        if similarity.is_nan() {
            return 0.0;
        }
        similarity.clamp(0.0, 1.0)
    }
}

/// Size of a message in budget units
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, message: &Message) -> usize;
}

/// Roughly four characters per token plus a fixed per-message overhead
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: usize,
    pub overhead: usize,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            overhead: 4,
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, message: &Message) -> usize {
        let chars = message.content.chars().count();
        chars.div_ceil(self.chars_per_token.max(1)) + self.overhead
    }
}

/// Builds [`ContextWindow`]s for incoming messages
pub struct ContextAssembler {
    db: Arc<ConversationDb>,
    embedder: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    recent_window: usize,
    top_k: usize,
    min_score: f32,
    scope: RetrievalScope,
    scoring: Arc<dyn ScoringPolicy>,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextAssembler {
    pub fn new(
        db: Arc<ConversationDb>,
        embedder: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            recent_window: config.recent_window_size,
            top_k: config.retrieved_top_k,
            min_score: config.retrieval_min_score,
            scope: config.retrieval_scope,
            scoring: Arc::new(RecencyDecay::default()),
            estimator: Arc::new(CharRatioEstimator::default()),
        }
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPolicy>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Assemble the context for `incoming_text` arriving in `conversation_id`.
    ///
    /// Fails only when the conversation is unknown or the store errors.
    pub async fn assemble(
        &self,
        conversation_id: &Uuid,
        incoming_text: &str,
        budget: usize,
    ) -> MemoryResult<ContextWindow> {
        let conversation = self.db.get_conversation(conversation_id)?;
        let recent = self.db.get_recent(conversation_id, self.recent_window)?;

        let mut window = ContextWindow {
            conversation_id: *conversation_id,
            items: Vec::new(),
            budget,
            total_tokens: 0,
            retrieval_degraded: false,
        };

        let Some(newest) = recent.last() else {
            return Ok(window);
        };
        let anchor_id = newest.id;

        let (hits, degraded) = self.retrieve(&conversation, &recent, incoming_text).await;
        window.retrieval_degraded = degraded;
        let retrieved = self.hydrate(&conversation, &recent, hits)?;

        let mut candidates: Vec<ContextItem> = Vec::with_capacity(recent.len() + retrieved.len());
        for (offset, message) in recent.iter().rev().enumerate() {
            candidates.push(ContextItem {
                estimated_tokens: self.estimator.estimate(message),
                score: self.scoring.recency_score(offset),
                reason: SelectionReason::Recent,
                message: message.clone(),
            });
        }
        for (message, similarity) in retrieved {
            let score = self.scoring.similarity_score(similarity);
            if score <= 0.0 {
                continue;
            }
            candidates.push(ContextItem {
                estimated_tokens: self.estimator.estimate(&message),
                score,
                reason: SelectionReason::Retrieved,
                message,
            });
        }

        let anchor_pos = candidates
            .iter()
            .position(|item| item.message.id == anchor_id)
            .unwrap_or(0);
        let anchor = candidates.swap_remove(anchor_pos);
        candidates.sort_by(rank);

        window.total_tokens = anchor.estimated_tokens;
        window.items.push(anchor);
        for candidate in candidates {
            let total = window.total_tokens + candidate.estimated_tokens;
            if total > budget {
                break;
            }
            window.total_tokens = total;
            window.items.push(candidate);
        }

        window.items.sort_by(|a, b| chronological(&a.message, &b.message));

        debug!(
            "Assembled context for {}: {} items ({} retrieved), {}/{} tokens{}",
            conversation_id,
            window.items.len(),
            window.retrieved().count(),
            window.total_tokens,
            budget,
            if window.retrieval_degraded { ", degraded" } else { "" }
        );

        Ok(window)
    }

    /// Nearest neighbours of the incoming text. The flag reports whether
    /// retrieval was skipped because a dependency failed.
    async fn retrieve(
        &self,
        conversation: &Conversation,
        recent: &[Message],
        incoming_text: &str,
    ) -> (Vec<ScoredMessage>, bool) {
        if self.top_k == 0 {
            return (Vec::new(), false);
        }

        let vector = match self.embedder.embed(incoming_text).await {
            Ok(Some(vector)) => vector,
            Ok(None) => return (Vec::new(), false),
            Err(e) => {
                report_skip(conversation, &e);
                return (Vec::new(), true);
            }
        };

        let mut query = VectorQuery::new(vector, conversation.user_id.clone(), self.top_k)
            .excluding(recent.iter().map(|m| m.id));
        if self.scope == RetrievalScope::Conversation {
            query = query.in_conversation(conversation.id);
        }
        if self.min_score > 0.0 {
            query = query.with_min_score(self.min_score);
        }

        match self.index.query(&query).await {
            Ok(hits) => (hits, false),
            Err(e) => {
                report_skip(conversation, &e);
                (Vec::new(), true)
            }
        }
    }

    /// Load hit messages from the store, keeping only indexed messages that
    /// belong to the requesting user and are not already recent.
    fn hydrate(
        &self,
        conversation: &Conversation,
        recent: &[Message],
        hits: Vec<ScoredMessage>,
    ) -> MemoryResult<Vec<(Message, f32)>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let recent_ids: HashSet<Uuid> = recent.iter().map(|m| m.id).collect();
        let ids: Vec<Uuid> = hits.iter().map(|hit| hit.message_id).collect();
        let mut found = self.db.find_by_ids(&ids)?;

        let mut owners: HashMap<Uuid, bool> = HashMap::new();
        owners.insert(conversation.id, true);

        let mut retrieved = Vec::with_capacity(hits.len());
        for hit in hits {
            if recent_ids.contains(&hit.message_id) {
                continue;
            }
            let Some(message) = found.remove(&hit.message_id) else {
                debug!("Dropping stale vector {}", hit.message_id);
                continue;
            };
            if message.embedding_status != EmbeddingStatus::Indexed {
                continue;
            }

            let owned = match owners.get(&message.conversation_id) {
                Some(owned) => *owned,
                None => {
                    let owned = match self.db.get_conversation(&message.conversation_id) {
                        Ok(other) => other.user_id == conversation.user_id,
                        Err(e) if e.is_not_found() => false,
                        Err(e) => return Err(e),
                    };
                    owners.insert(message.conversation_id, owned);
                    owned
                }
            };
            if !owned {
                warn!("Dropping vector {} owned by another user", hit.message_id);
                continue;
            }

            retrieved.push((message, hit.similarity));
        }
        Ok(retrieved)
    }
}

/// Degradable errors warn, anything else logs at error level
fn report_skip(conversation: &Conversation, error: &MemoryError) {
    if error.is_degradable() {
        warn!("Skipping semantic recall for {}: {}", conversation.id, error);
    } else {
        error!("Semantic recall for {} failed unexpectedly: {}", conversation.id, error);
    }
}

/// Selection order: higher score, recent before retrieved, newer, then id
fn rank(a: &ContextItem, b: &ContextItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| reason_rank(a.reason).cmp(&reason_rank(b.reason)))
        .then_with(|| chronological(&b.message, &a.message))
}

fn reason_rank(reason: SelectionReason) -> u8 {
    match reason {
        SelectionReason::Recent => 0,
        SelectionReason::Retrieved => 1,
    }
}

fn chronological(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.seq.cmp(&b.seq))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use crate::memory::embeddings::EmbeddingProvider;
    use crate::memory::store::InMemoryIndex;
    use crate::memory::writer::MemoryWriter;
    use crate::config::IndexingMode;
    use crate::retry::RetryConfig;
    use crate::test_support::{FailingEmbedder, UnreachableIndex, VocabularyEmbedder, TEST_DIM};
    use std::time::Duration;

    /// Every message costs exactly one unit
    struct UnitEstimator;

    impl TokenEstimator for UnitEstimator {
        fn estimate(&self, _message: &Message) -> usize {
            1
        }
    }

    fn test_config(recent: usize, top_k: usize) -> EngineConfig {
        EngineConfig {
            recent_window_size: recent,
            retrieved_top_k: top_k,
            retrieval_min_score: 0.1,
            ..EngineConfig::default()
        }
    }

    struct Fixture {
        db: Arc<ConversationDb>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingClient>,
        writer: MemoryWriter,
    }

    fn fixture_with(provider: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Fixture {
        let db = Arc::new(ConversationDb::in_memory().unwrap());
        let embedder = Arc::new(EmbeddingClient::new(
            provider,
            RetryConfig::immediate(1),
            TEST_DIM,
            Duration::from_secs(60),
        ));
        let writer = MemoryWriter::new(
            db.clone(),
            embedder.clone(),
            index.clone(),
            IndexingMode::Inline,
            Duration::ZERO,
        );
        Fixture {
            db,
            index,
            embedder,
            writer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Arc::new(VocabularyEmbedder::new()),
            Arc::new(InMemoryIndex::new()),
        )
    }

    impl Fixture {
        fn assembler(&self, config: &EngineConfig) -> ContextAssembler {
            ContextAssembler::new(
                self.db.clone(),
                self.embedder.clone(),
                self.index.clone(),
                config,
            )
        }

        async fn say(&self, conversation: &Uuid, texts: &[&str]) -> Vec<Message> {
            let mut out = Vec::new();
            for (i, text) in texts.iter().enumerate() {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                out.push(self.writer.append_message(conversation, role, text).await.unwrap());
            }
            out
        }
    }

    fn contents(window: &ContextWindow) -> Vec<&str> {
        window.items.iter().map(|i| i.message.content.as_str()).collect()
    }

    #[test]
    fn test_recency_decay_is_monotonic() {
        let policy = RecencyDecay::default();
        assert_eq!(policy.recency_score(0), 1.0);
        assert!((policy.recency_score(5) - 0.5).abs() < 1e-6);
        assert!(policy.recency_score(1) > policy.recency_score(2));
        assert_eq!(policy.similarity_score(1.7), 1.0);
        assert_eq!(policy.similarity_score(-0.3), 0.0);
        assert_eq!(policy.similarity_score(f32::NAN), 0.0);
    }

    #[test]
    fn test_char_ratio_estimate() {
        let estimator = CharRatioEstimator::default();
        let mut message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            seq: 1,
            role: Role::User,
            content: String::new(),
            created_at: 0,
            embedding_status: EmbeddingStatus::Pending,
            status_updated_at: 0,
            index_attempts: 0,
        };
        assert_eq!(estimator.estimate(&message), 4);
        message.content = "hello".to_string();
        assert_eq!(estimator.estimate(&message), 6);
        message.content = "abcdefgh".to_string();
        assert_eq!(estimator.estimate(&message), 6);
    }

    #[tokio::test]
    async fn test_recalls_older_relevant_message() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(
            &conversation.id,
            &[
                "I love hiking",
                "My dog is named Max",
                "I work as a nurse",
                "I'm cooking pasta tonight",
                "What's the weather?",
            ],
        )
        .await;

        let window = f
            .assembler(&test_config(3, 5))
            .assemble(&conversation.id, "Any hiking trail recommendations?", 1000)
            .await
            .unwrap();

        assert_eq!(
            contents(&window),
            vec![
                "I love hiking",
                "I work as a nurse",
                "I'm cooking pasta tonight",
                "What's the weather?"
            ]
        );
        assert_eq!(window.items[0].reason, SelectionReason::Retrieved);
        assert!(window.items[1..]
            .iter()
            .all(|item| item.reason == SelectionReason::Recent));
        assert!(!window.retrieval_degraded);
    }

    #[tokio::test]
    async fn test_unrelated_messages_not_recalled_without_threshold() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(
            &conversation.id,
            &[
                "I love hiking",
                "My dog is named Max",
                "I work as a nurse",
                "I'm cooking pasta tonight",
                "What's the weather?",
            ],
        )
        .await;

        let config = EngineConfig {
            retrieval_min_score: 0.0,
            ..test_config(3, 5)
        };
        let window = f
            .assembler(&config)
            .assemble(&conversation.id, "Any hiking trail recommendations?", 1000)
            .await
            .unwrap();

        assert!(!contents(&window).contains(&"My dog is named Max"));
        assert_eq!(window.retrieved().count(), 1);
        assert!(window.items.iter().all(|item| item.score > 0.0));
    }

    #[tokio::test]
    async fn test_budget_truncates_oldest_recent_first() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(&conversation.id, &["one", "two", "three", "four", "five"]).await;

        let window = f
            .assembler(&test_config(5, 0))
            .with_estimator(Arc::new(UnitEstimator))
            .assemble(&conversation.id, "anything", 3)
            .await
            .unwrap();

        assert_eq!(contents(&window), vec!["three", "four", "five"]);
        assert_eq!(window.total_tokens, 3);
    }

    #[tokio::test]
    async fn test_anchor_kept_when_over_budget() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(&conversation.id, &["short", "a much longer closing message"]).await;

        let window = f
            .assembler(&test_config(5, 5))
            .assemble(&conversation.id, "closing", 1)
            .await
            .unwrap();

        assert_eq!(contents(&window), vec!["a much longer closing message"]);
        assert!(window.total_tokens > window.budget);
    }

    #[tokio::test]
    async fn test_total_never_exceeds_budget_beyond_anchor() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        let texts: Vec<String> = (0..20)
            .map(|i| format!("message {} about hiking and {}", i, "trail ".repeat(i % 4)))
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        f.say(&conversation.id, &refs).await;

        let assembler = f.assembler(&test_config(6, 5));
        for budget in [20, 45, 80, 150, 400] {
            let window = assembler
                .assemble(&conversation.id, "hiking trail", budget)
                .await
                .unwrap();
            assert!(window.total_tokens <= budget);
            let sum: usize = window.items.iter().map(|i| i.estimated_tokens).sum();
            assert_eq!(sum, window.total_tokens);
            assert_eq!(window.items.last().unwrap().message.content, refs[19]);
            let ids: HashSet<_> = window.message_ids().into_iter().collect();
            assert_eq!(ids.len(), window.len());
        }
    }

    #[tokio::test]
    async fn test_tie_prefers_recent() {
        struct Flat;
        impl ScoringPolicy for Flat {
            fn recency_score(&self, _position: usize) -> f32 {
                0.5
            }
            fn similarity_score(&self, _similarity: f32) -> f32 {
                0.5
            }
        }

        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(&conversation.id, &["hiking plans", "x", "y", "z"]).await;

        let window = f
            .assembler(&test_config(3, 5))
            .with_scoring(Arc::new(Flat))
            .with_estimator(Arc::new(UnitEstimator))
            .assemble(&conversation.id, "hiking", 3)
            .await
            .unwrap();

        assert_eq!(contents(&window), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_recent() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(&conversation.id, &["I love hiking", "a", "b", "c"]).await;

        let broken = fixture_with(Arc::new(FailingEmbedder::transient()), f.index.clone());
        let assembler = ContextAssembler::new(
            f.db.clone(),
            broken.embedder.clone(),
            f.index.clone(),
            &test_config(3, 5),
        );

        let window = assembler
            .assemble(&conversation.id, "hiking", 1000)
            .await
            .unwrap();
        assert_eq!(contents(&window), vec!["a", "b", "c"]);
        assert!(window.retrieval_degraded);
    }

    #[tokio::test]
    async fn test_index_failure_degrades_to_recent() {
        let f = fixture_with(Arc::new(VocabularyEmbedder::new()), Arc::new(UnreachableIndex));
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(&conversation.id, &["I love hiking", "a", "b"]).await;

        let window = f
            .assembler(&test_config(2, 5))
            .assemble(&conversation.id, "hiking", 1000)
            .await
            .unwrap();
        assert_eq!(contents(&window), vec!["a", "b"]);
        assert!(window.retrieval_degraded);
    }

    #[tokio::test]
    async fn test_other_users_never_recalled() {
        let f = fixture();
        let mine = f.db.create_conversation("user-a").unwrap();
        let theirs = f.db.create_conversation("user-b").unwrap();
        f.say(&theirs.id, &["secret hiking spot"]).await;
        f.say(&mine.id, &["hello", "there"]).await;

        let window = f
            .assembler(&test_config(2, 5))
            .assemble(&mine.id, "hiking spot", 1000)
            .await
            .unwrap();
        assert_eq!(contents(&window), vec!["hello", "there"]);
    }

    #[tokio::test]
    async fn test_conversation_scope_limits_recall() {
        let f = fixture();
        let first = f.db.create_conversation("user-a").unwrap();
        let second = f.db.create_conversation("user-a").unwrap();
        f.say(&first.id, &["I love hiking"]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.say(&second.id, &["hi", "ok"]).await;

        let user_scoped = f
            .assembler(&test_config(2, 5))
            .assemble(&second.id, "hiking", 1000)
            .await
            .unwrap();
        assert_eq!(contents(&user_scoped), vec!["I love hiking", "hi", "ok"]);

        let config = EngineConfig {
            retrieval_scope: RetrievalScope::Conversation,
            ..test_config(2, 5)
        };
        let conversation_scoped = f
            .assembler(&config)
            .assemble(&second.id, "hiking", 1000)
            .await
            .unwrap();
        assert_eq!(contents(&conversation_scoped), vec!["hi", "ok"]);
    }

    #[tokio::test]
    async fn test_empty_and_missing_conversations() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        let window = f
            .assembler(&test_config(3, 5))
            .assemble(&conversation.id, "hello", 100)
            .await
            .unwrap();
        assert!(window.is_empty());

        let err = f
            .assembler(&test_config(3, 5))
            .assemble(&Uuid::new_v4(), "hello", 100)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_assembly_is_deterministic() {
        let f = fixture();
        let conversation = f.db.create_conversation("user-a").unwrap();
        f.say(
            &conversation.id,
            &["hiking boots", "hiking poles", "trail mix", "x", "y", "z"],
        )
        .await;

        let assembler = f.assembler(&test_config(2, 5));
        let first = assembler
            .assemble(&conversation.id, "hiking trail", 30)
            .await
            .unwrap();
        let second = assembler
            .assemble(&conversation.id, "hiking trail", 30)
            .await
            .unwrap();
        assert_eq!(first.message_ids(), second.message_ids());
    }
}
