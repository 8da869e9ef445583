//! ============================================================================
//! Vector Index - Qdrant-backed semantic index over message embeddings
//! ============================================================================
//! Points are keyed by message id, so re-indexing a message overwrites it.
//! Every query carries an explicit `user_id` filter; nothing relies on
//! physically separate collections for tenant isolation.
//! ============================================================================

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    Distance, FieldType, Filter, PointId, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{MemoryVector, ScoredMessage, VectorQuery};
use crate::config::EngineConfig;
use crate::types::{MemoryError, MemoryResult};

/// Upsert/query surface of a vector index
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector keyed by its message id
    async fn upsert(&self, vector: MemoryVector) -> MemoryResult<()>;

    /// Nearest neighbours for one user, best first
    async fn query(&self, query: &VectorQuery) -> MemoryResult<Vec<ScoredMessage>>;

    /// Number of stored vectors
    async fn count(&self) -> MemoryResult<u64>;

    /// Check if the index is reachable
    async fn health_check(&self) -> MemoryResult<bool>;
}

fn index_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> MemoryError {
    move |e| MemoryError::IndexUnavailable(format!("{}: {}", context, e))
}

// ============================================================================
// Qdrant
// ============================================================================

/// Vector index backed by a Qdrant collection
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl QdrantIndex {
    /// Connect to Qdrant and make sure the collection exists
    pub async fn connect(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
        timeout: Duration,
    ) -> MemoryResult<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .timeout(timeout)
            .build()
            .map_err(index_err("Failed to create Qdrant client"))?;

        let index = Self {
            client,
            collection: collection.to_string(),
            dimension,
        };
        index.ensure_collection().await?;

        Ok(index)
    }

    pub async fn from_config(config: &EngineConfig) -> MemoryResult<Self> {
        Self::connect(
            &config.qdrant_url,
            config.qdrant_api_key.clone(),
            &config.qdrant_collection,
            config.embedding_dim,
            config.request_timeout,
        )
        .await
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn ensure_collection(&self) -> MemoryResult<()> {
        let exists = self
            .client
            .collection_exists(self.collection.as_str())
            .await
            .map_err(index_err("Failed to check collection existence"))?;

        if exists {
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!("Creating collection: {}", self.collection);

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(index_err("Failed to create collection"))?;

        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                &self.collection,
                "user_id",
                FieldType::Keyword,
            ))
            .await
            .map_err(index_err("Failed to index user_id payload"))?;

        info!("Collection {} created successfully", self.collection);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, vector: MemoryVector) -> MemoryResult<()> {
        if vector.vector.is_empty() {
            return Err(MemoryError::IndexUnavailable(
                "Cannot upsert vector without components".to_string(),
            ));
        }

        let message_id = vector.message_id();
        let payload_data = &vector.payload;
        let payload: HashMap<String, Value> = [
            ("message_id", Value::from(payload_data.message_id.to_string())),
            (
                "conversation_id",
                Value::from(payload_data.conversation_id.to_string()),
            ),
            ("user_id", Value::from(payload_data.user_id.clone())),
            ("role", Value::from(payload_data.role.as_str().to_string())),
            ("created_at", Value::from(payload_data.created_at)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let point = PointStruct::new(message_id.to_string(), vector.vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(index_err("Failed to upsert vector"))?;

        debug!("Vector for message {} upserted", message_id);
        Ok(())
    }

    async fn query(&self, query: &VectorQuery) -> MemoryResult<Vec<ScoredMessage>> {
        if query.top_k == 0 {
            return Ok(vec![]);
        }

        debug!(
            "Searching vectors for user {} (top_k: {}, excluded: {})",
            query.user_id,
            query.top_k,
            query.exclude_ids.len()
        );

        let mut must = vec![Condition::matches("user_id", query.user_id.clone())];
        if let Some(conversation_id) = query.conversation_id {
            must.push(Condition::matches(
                "conversation_id",
                conversation_id.to_string(),
            ));
        }
        let mut filter = Filter::must(must);
        if !query.exclude_ids.is_empty() {
            let excluded: Vec<PointId> = query
                .exclude_ids
                .iter()
                .map(|id| PointId::from(id.to_string()))
                .collect();
            filter.must_not.push(Condition::has_id(excluded));
        }

        let mut search =
            SearchPointsBuilder::new(&self.collection, query.vector.clone(), query.top_k as u64)
                .filter(filter)
                .with_payload(false);
        if let Some(min_score) = query.min_score {
            search = search.score_threshold(min_score);
        }

        let search_result = self
            .client
            .search_points(search)
            .await
            .map_err(index_err("Failed to search vectors"))?;

        let mut hits: Vec<ScoredMessage> = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                Some(ScoredMessage {
                    message_id: extract_uuid_from_point_id(point.id?)?,
                    similarity: point.score,
                })
            })
            .collect();
        sort_hits(&mut hits);

        debug!("Found {} matching vectors", hits.len());
        Ok(hits)
    }

    async fn count(&self) -> MemoryResult<u64> {
        let info = self
            .client
            .collection_info(self.collection.as_str())
            .await
            .map_err(index_err("Failed to get collection info"))?;

        Ok(info.result.map(|r| r.points_count.unwrap_or(0)).unwrap_or(0))
    }

    async fn health_check(&self) -> MemoryResult<bool> {
        match self.client.health_check().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Helper to extract UUID from PointId
fn extract_uuid_from_point_id(point_id: PointId) -> Option<Uuid> {
    match point_id.point_id_options? {
        PointIdOptions::Uuid(uuid_str) => Uuid::parse_str(&uuid_str).ok(),
        PointIdOptions::Num(_) => None,
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Exact cosine search over vectors held in process memory.
/// Used for tests and single-process runs without a Qdrant server.
#[derive(Default)]
pub struct InMemoryIndex {
    points: RwLock<HashMap<Uuid, MemoryVector>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored projection of one message, if any
    pub async fn get(&self, message_id: &Uuid) -> Option<MemoryVector> {
        self.points.read().await.get(message_id).cloned()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, vector: MemoryVector) -> MemoryResult<()> {
        if vector.vector.is_empty() {
            return Err(MemoryError::IndexUnavailable(
                "Cannot upsert vector without components".to_string(),
            ));
        }
        let mut points = self.points.write().await;
        points.insert(vector.message_id(), vector);
        Ok(())
    }

    async fn query(&self, query: &VectorQuery) -> MemoryResult<Vec<ScoredMessage>> {
        let points = self.points.read().await;

        let mut hits: Vec<ScoredMessage> = points
            .values()
            .filter(|p| p.payload.user_id == query.user_id)
            .filter(|p| {
                query
                    .conversation_id
                    .map_or(true, |c| p.payload.conversation_id == c)
            })
            .filter(|p| !query.exclude_ids.contains(&p.payload.message_id))
            .map(|p| ScoredMessage {
                message_id: p.payload.message_id,
                similarity: cosine_similarity(&query.vector, &p.vector),
            })
            .filter(|hit| query.min_score.map_or(true, |min| hit.similarity >= min))
            .collect();

        sort_hits(&mut hits);
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn count(&self) -> MemoryResult<u64> {
        Ok(self.points.read().await.len() as u64)
    }

    async fn health_check(&self) -> MemoryResult<bool> {
        Ok(true)
    }
}

/// Descending similarity; message id breaks ties so results are stable
fn sort_hits(hits: &mut [ScoredMessage]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
}

/// Cosine similarity; 0.0 when either side has no magnitude or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
