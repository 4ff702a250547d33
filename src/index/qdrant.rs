//! Qdrant vector index
//!
//! Stores one point per chunk (point id = chunk id) with the owning document
//! and chunk sequence index in the payload. Scoping uses a payload filter on
//! `document_id`.

use super::{check_dimension, rank_hits, IndexEntry, ScoredChunk, VectorIndex};
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info};

const DOCUMENT_ID_KEY: &str = "document_id";
const CHUNK_ID_KEY: &str = "chunk_id";
const CHUNK_INDEX_KEY: &str = "chunk_index";

/// Extra hits fetched past `top_k` so score ties at the cutoff can be
/// re-ranked by chunk index before truncating. Ties wider than this window
/// still fall back to Qdrant's order.
const TIE_WINDOW: usize = 16;

/// Vector index backed by a Qdrant collection
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl QdrantIndex {
    /// Connect to Qdrant using config
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::new(
            &config.index.qdrant_url,
            config.qdrant_api_key(),
            &config.index.collection_name,
            config.embedding.dimension,
        )
    }

    /// Create a new connection directly with URL and collection name
    pub fn new(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dimension: usize,
    ) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let mut builder = Qdrant::from_url(url).skip_compatibility_check();
        if let Some(key) = api_key {
            builder = builder.api_key(key);
        }
        let client = builder.build().map_err(|e| Error::Qdrant(e.to_string()))?;

        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Ensure the collection exists with cosine distance and the configured dimension
    pub async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection {} with dimension {}",
            self.collection, self.dimension
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                ),
            )
            .await?;
        Ok(())
    }
}

/// Build the payload filter for a candidate document set (`None` = all documents)
fn document_filter(candidate_document_ids: &[String]) -> Option<Filter> {
    if candidate_document_ids.is_empty() {
        return None;
    }
    Some(Filter::should(
        candidate_document_ids
            .iter()
            .map(|id| Condition::matches(DOCUMENT_ID_KEY, id.clone())),
    ))
}

fn entry_payload(entry: &IndexEntry) -> HashMap<String, QdrantValue> {
    let mut map = HashMap::new();
    map.insert(
        DOCUMENT_ID_KEY.to_string(),
        string_to_qdrant(&entry.document_id),
    );
    map.insert(CHUNK_ID_KEY.to_string(), string_to_qdrant(&entry.chunk_id));
    map.insert(
        CHUNK_INDEX_KEY.to_string(),
        QdrantValue {
            kind: Some(Kind::IntegerValue(entry.chunk_index as i64)),
        },
    );
    map
}

fn string_to_qdrant(s: &str) -> QdrantValue {
    QdrantValue {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn payload_string(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_index(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<usize> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::IntegerValue(i) => usize::try_from(*i).ok(),
        Kind::DoubleValue(d) if *d >= 0.0 => Some(*d as usize),
        _ => None,
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn insert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            check_dimension(self.dimension, entry.vector.len())?;
        }

        debug!(
            "Upserting {} points to collection {}",
            entries.len(),
            self.collection
        );

        let points: Vec<PointStruct> = entries
            .into_iter()
            .map(|entry| {
                let payload = entry_payload(&entry);
                PointStruct::new(entry.chunk_id, entry.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        candidate_document_ids: &[String],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        check_dimension(self.dimension, query.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let limit = (top_k + TIE_WINDOW) as u64;
        let mut builder =
            SearchPointsBuilder::new(&self.collection, query.to_vec(), limit).with_payload(true);
        if let Some(filter) = document_filter(candidate_document_ids) {
            builder = builder.filter(filter);
        }

        let response = self.client.search_points(builder).await?;

        let hits: Vec<ScoredChunk> = response
            .result
            .into_iter()
            .filter_map(|point| {
                Some(ScoredChunk {
                    chunk_id: payload_string(&point.payload, CHUNK_ID_KEY)?,
                    document_id: payload_string(&point.payload, DOCUMENT_ID_KEY)?,
                    chunk_index: payload_index(&point.payload, CHUNK_INDEX_KEY)?,
                    score: point.score,
                })
            })
            .collect();

        Ok(top_ranked(hits, top_k))
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let before = self.count().await?;

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(owned_by(document_id))
                    .wait(true),
            )
            .await?;

        let after = self.count().await?;
        Ok(before.saturating_sub(after))
    }

    async fn count(&self) -> Result<usize> {
        let info = self.client.collection_info(&self.collection).await?;
        let points = info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0);
        Ok(points as usize)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Qdrant orders by score only; restore the chunk-index tie-break, then cut
fn top_ranked(mut hits: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    rank_hits(&mut hits);
    hits.truncate(top_k);
    hits
}

/// Every point belonging to one document
fn owned_by(document_id: &str) -> Filter {
    Filter::must([Condition::matches(DOCUMENT_ID_KEY, document_id.to_string())])
}
