//! Vector index
//!
//! Stores chunk vectors keyed by document and answers cosine-similarity
//! nearest-neighbour queries scoped to a set of documents.
//!
//! | Backend | Storage | Notes |
//! |---------|---------|-------|
//! | [`InMemoryIndex`] | process memory | brute-force cosine, hydrated from SQLite at startup |
//! | [`QdrantIndex`] | Qdrant collection | external service, same ordering contract |
//!
//! Every backend returns results ordered by descending score, with ties
//! broken by ascending chunk sequence index.

mod memory;
mod qdrant;

pub use memory::*;
pub use qdrant::*;

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

/// Supported vector index backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackendKind {
    Memory,
    Qdrant,
}

impl FromStr for IndexBackendKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(Error::Config(format!(
                "Unsupported index backend '{}'; expected 'memory' or 'qdrant'",
                value
            ))),
        }
    }
}

/// One chunk vector to be indexed
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: usize,
    pub vector: Vec<f32>,
}

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
}

/// Trait for vector index backends
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert (or replace, by chunk id) a batch of chunk vectors
    async fn insert(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Find the `top_k` chunks most similar to `query`.
    ///
    /// Only chunks of `candidate_document_ids` are considered; an empty slice
    /// searches every indexed document.
    async fn search(
        &self,
        query: &[f32],
        candidate_document_ids: &[String],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove all vectors of a document, returning how many were removed
    async fn delete(&self, document_id: &str) -> Result<usize>;

    /// Total number of indexed vectors
    async fn count(&self) -> Result<usize>;

    /// Vector dimension shared by every entry
    fn dimension(&self) -> usize;
}

/// Create the configured index backend
pub async fn create_index(config: &Config) -> Result<Arc<dyn VectorIndex>> {
    let dimension = config.embedding.dimension;
    let index: Arc<dyn VectorIndex> = match config.index.backend.parse()? {
        IndexBackendKind::Memory => Arc::new(InMemoryIndex::new(dimension)),
        IndexBackendKind::Qdrant => {
            let index = QdrantIndex::connect(config).await?;
            index.ensure_collection().await?;
            Arc::new(index)
        }
    };
    Ok(index)
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for mismatched lengths, empty input, zero-norm vectors, or
/// when overflowing components make the result non-finite.
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    let score = dot / denom;
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(-1.0, 1.0)
}

/// Order hits by descending score, then ascending chunk index.
///
/// Document and chunk ids break any remaining tie so the order is total.
pub fn rank_hits(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimensionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, chunk_index: usize, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: chunk_id.to_string(),
            document_id: "doc".to_string(),
            chunk_index,
            score,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_hits_breaks_ties_by_chunk_index() {
        let mut hits = vec![hit("c", 7, 0.5), hit("a", 3, 0.9), hit("b", 2, 0.5)];
        rank_hits(&mut hits);

        let order: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cosine_similarity_overflow_is_zero() {
        let huge = [f32::MAX, f32::MAX];
        assert_eq!(cosine_similarity(&huge, &huge), 0.0);
    }

    #[test]
    fn test_rank_hits_total_with_nan() {
        let mut hits = vec![
            hit("a", 0, 0.4),
            hit("nan", 1, f32::NAN),
            hit("b", 2, 0.8),
            hit("c", 3, 0.4),
        ];
        rank_hits(&mut hits);
        let first: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();

        hits.reverse();
        rank_hits(&mut hits);
        let second: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();

        assert_eq!(first, second);
        let finite: Vec<&str> = first.iter().map(String::as_str).filter(|id| *id != "nan").collect();
        assert_eq!(finite, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!(
            "memory".parse::<IndexBackendKind>().unwrap(),
            IndexBackendKind::Memory
        );
        assert_eq!(
            "QDRANT".parse::<IndexBackendKind>().unwrap(),
            IndexBackendKind::Qdrant
        );
        assert!("faiss".parse::<IndexBackendKind>().is_err());
    }
}
