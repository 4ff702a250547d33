//! In-memory vector index
//!
//! Vectors are grouped per document behind a single read-write lock:
//! searches take the read side, inserts and deletes the write side.

use super::{check_dimension, cosine_similarity, rank_hits, IndexEntry, ScoredChunk, VectorIndex};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredVector {
    chunk_id: String,
    chunk_index: usize,
    vector: Vec<f32>,
}

/// Brute-force cosine similarity index held in process memory
#[derive(Debug)]
pub struct InMemoryIndex {
    dimension: usize,
    documents: RwLock<HashMap<String, Vec<StoredVector>>>,
}

impl InMemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Number of documents with at least one vector
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

fn score_document(
    document_id: &str,
    vectors: &[StoredVector],
    query: &[f32],
    hits: &mut Vec<ScoredChunk>,
) {
    hits.extend(vectors.iter().map(|stored| ScoredChunk {
        chunk_id: stored.chunk_id.clone(),
        document_id: document_id.to_string(),
        chunk_index: stored.chunk_index,
        score: cosine_similarity(query, &stored.vector),
    }));
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn insert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        for entry in &entries {
            check_dimension(self.dimension, entry.vector.len())?;
        }

        let mut documents = self.documents.write().await;
        for entry in entries {
            let vectors = documents.entry(entry.document_id).or_default();
            let stored = StoredVector {
                chunk_id: entry.chunk_id,
                chunk_index: entry.chunk_index,
                vector: entry.vector,
            };
            match vectors.iter_mut().find(|v| v.chunk_id == stored.chunk_id) {
                Some(existing) => *existing = stored,
                None => vectors.push(stored),
            }
        }
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

        let documents = self.documents.read().await;
        let mut hits = Vec::new();

        if candidate_document_ids.is_empty() {
            for (document_id, vectors) in documents.iter() {
                score_document(document_id, vectors, query, &mut hits);
            }
        } else {
            for document_id in candidate_document_ids {
                if let Some(vectors) = documents.get(document_id) {
                    score_document(document_id, vectors, query, &mut hits);
                }
            }
        }
        drop(documents);

        let scanned = hits.len();
        rank_hits(&mut hits);
        hits.truncate(top_k);
        debug!("Scanned {} vectors, returning {}", scanned, hits.len());

        Ok(hits)
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let removed = self
            .documents
            .write()
            .await
            .remove(document_id)
            .map(|v| v.len())
            .unwrap_or(0);
        debug!("Removed {} vectors for document {}", removed, document_id);
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.documents.read().await.values().map(Vec::len).sum())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;

    fn entry(document_id: &str, chunk_index: usize, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            document_id: document_id.to_string(),
            chunk_id: format!("{}-{}", document_id, chunk_index),
            chunk_index,
            vector,
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_index() {
        let index = InMemoryIndex::new(2);
        index
            .insert(vec![
                entry("doc-a", 3, vec![1.0, 1.0]),
                entry("doc-a", 0, vec![0.0, 1.0]),
                entry("doc-a", 1, vec![1.0, 1.0]),
                entry("doc-a", 2, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 1.0], &[], 10).await.unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.chunk_index).collect();

        assert_eq!(order[..2], [1, 3]);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_candidates() {
        let index = InMemoryIndex::new(2);
        index
            .insert(vec![
                entry("doc-a", 0, vec![1.0, 0.0]),
                entry("doc-b", 0, vec![1.0, 0.0]),
                entry("doc-c", 0, vec![0.9, 0.1]),
            ])
            .await
            .unwrap();

        let scoped = index
            .search(&[1.0, 0.0], &["doc-c".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].document_id, "doc-c");

        let all = index.search(&[1.0, 0.0], &[], 5).await.unwrap();
        assert_eq!(all.len(), 3);

        let unknown = index
            .search(&[1.0, 0.0], &["missing".to_string()], 5)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let index = InMemoryIndex::new(1);
        let entries = (0..10).map(|i| entry("doc", i, vec![1.0])).collect();
        index.insert(entries).await.unwrap();

        let hits = index.search(&[1.0], &[], 3).await.unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.chunk_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = InMemoryIndex::new(3);
        let err = index
            .insert(vec![entry("doc", 0, vec![1.0, 2.0])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.search(&[1.0], &[], 1).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_reinsert() {
        let index = InMemoryIndex::new(1);
        index
            .insert(vec![entry("doc-a", 0, vec![1.0]), entry("doc-b", 0, vec![1.0])])
            .await
            .unwrap();
        // Re-inserting the same chunk id replaces instead of duplicating
        index.insert(vec![entry("doc-a", 0, vec![0.5])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        assert_eq!(index.delete("doc-a").await.unwrap(), 1);
        assert_eq!(index.delete("doc-a").await.unwrap(), 0);
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_and_searches() {
        let index = Arc::new(InMemoryIndex::new(2));
        let mut handles = Vec::new();

        for d in 0..8 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move {
                let doc = format!("doc-{}", d);
                let entries = (0..25).map(|i| entry(&doc, i, vec![1.0, i as f32])).collect();
                index.insert(entries).await.unwrap();
                index.search(&[1.0, 0.0], &[doc], 5).await.unwrap().len()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 5);
        }
        assert_eq!(index.count().await.unwrap(), 200);
    }
}
