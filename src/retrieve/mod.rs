//! Query-time retrieval
//!
//! Embeds a query, searches the vector index within the documents linked to
//! a conversation, and resolves the hits to full chunk records from the
//! store. An empty document set yields no evidence; it never widens into a
//! global search.

use crate::chunk::compute_text_hash;
use crate::config::{Config, RetrievalConfig};
use crate::embed::{embed_with_timeout, Embedder};
use crate::error::Result;
use crate::index::{ScoredChunk, VectorIndex};
use crate::meta::{Chunk, Persistence};
use crate::tokens::count_tokens;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A chunk resolved from a search hit
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f32,
}

impl RetrievedChunk {
    pub fn tokens(&self) -> usize {
        self.chunk.tokens()
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }

    pub fn text(&self) -> &str {
        &self.chunk.text
    }
}

/// Retrieves the most relevant chunks for a query
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn Persistence>,
    settings: RetrievalConfig,
    embed_timeout: Duration,
    merge_limit: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn Persistence>,
        settings: RetrievalConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            settings,
            embed_timeout,
            merge_limit: usize::MAX,
        }
    }

    /// Cap the token count of a merged run of adjacent chunks
    pub fn with_merge_limit(mut self, max_tokens: usize) -> Self {
        self.merge_limit = max_tokens;
        self
    }

    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        Self::new(
            embedder,
            index,
            store,
            config.retrieval.clone(),
            config.embedding.timeout(),
        )
        .with_merge_limit(config.chunk.max_tokens)
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Retrieve up to `top_k` chunks (default from config) from the linked
    /// documents, most relevant first.
    pub async fn retrieve(
        &self,
        query: &str,
        linked_document_ids: &[String],
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedChunk>> {
        if linked_document_ids.is_empty() {
            debug!("No linked documents, skipping retrieval");
            return Ok(Vec::new());
        }
        self.search(query, linked_document_ids, top_k).await
    }

    /// Search every indexed document. Diagnostics only; conversations always
    /// go through [`Retriever::retrieve`].
    pub async fn search_all(&self, query: &str, top_k: Option<usize>) -> Result<Vec<RetrievedChunk>> {
        self.search(query, &[], top_k).await
    }

    async fn search(
        &self,
        query: &str,
        document_ids: &[String],
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedChunk>> {
        let top_k = top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = embed_with_timeout(self.embedder.as_ref(), query, self.embed_timeout).await?;

        let mut hits = self.index.search(&query_vector, document_ids, top_k).await?;
        debug!("Vector index returned {} hits", hits.len());

        if let Some(floor) = self.settings.min_score {
            hits.retain(|hit| hit.score >= floor);
        }

        let mut results = self.resolve(hits).await?;
        if self.settings.merge_adjacent {
            results = merge_adjacent(results, self.merge_limit);
        }

        info!(
            "Retrieved {} chunks from {} documents",
            results.len(),
            if document_ids.is_empty() {
                "all".to_string()
            } else {
                document_ids.len().to_string()
            }
        );
        Ok(results)
    }

    async fn resolve(&self, hits: Vec<ScoredChunk>) -> Result<Vec<RetrievedChunk>> {
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut chunks: HashMap<String, Chunk> = self
            .store
            .get_chunks_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match chunks.remove(&hit.chunk_id) {
                Some(chunk) => results.push(RetrievedChunk {
                    chunk,
                    score: hit.score,
                }),
                None => warn!(
                    "Indexed chunk {} of document {} has no stored record",
                    hit.chunk_id, hit.document_id
                ),
            }
        }
        Ok(results)
    }
}

/// Merge retrieved chunks that are neighbours in the same document.
///
/// Each run of consecutive sequence indices becomes one record spanning the
/// run, with the shared overlap kept once. The merged record takes the lowest
/// index and the highest score; output stays ordered by relevance. A run
/// never grows past `max_tokens`; the chunk that would overflow it starts a
/// new run.
pub fn merge_adjacent(chunks: Vec<RetrievedChunk>, max_tokens: usize) -> Vec<RetrievedChunk> {
    if chunks.len() < 2 {
        return chunks;
    }

    let mut by_position = chunks;
    by_position.sort_by(|a, b| {
        a.chunk
            .document_id
            .cmp(&b.chunk.document_id)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });

    // (record, index of the last chunk folded into it)
    let mut runs: Vec<(RetrievedChunk, i64)> = Vec::with_capacity(by_position.len());
    for next in by_position {
        match runs.last_mut() {
            Some((prev, last_index))
                if prev.chunk.document_id == next.chunk.document_id
                    && *last_index + 1 == next.chunk.chunk_index =>
            {
                let index = next.chunk.chunk_index;
                let mut candidate = prev.clone();
                append_span(&mut candidate, next.clone());
                if candidate.tokens() <= max_tokens {
                    *prev = candidate;
                    *last_index = index;
                } else {
                    runs.push((next, index));
                }
            }
            _ => {
                let index = next.chunk.chunk_index;
                runs.push((next, index));
            }
        }
    }

    let mut merged: Vec<RetrievedChunk> = runs.into_iter().map(|(record, _)| record).collect();
    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
    });
    merged
}

fn append_span(prev: &mut RetrievedChunk, next: RetrievedChunk) {
    let prev_end = prev.chunk.byte_end;
    let next_start = next.chunk.byte_start;

    if next_start < prev_end {
        let skip = (prev_end - next_start) as usize;
        match next.chunk.text.get(skip..) {
            Some(tail) => prev.chunk.text.push_str(tail),
            None => {
                prev.chunk.text.push('\n');
                prev.chunk.text.push_str(&next.chunk.text);
            }
        }
    } else {
        prev.chunk.text.push('\n');
        prev.chunk.text.push_str(&next.chunk.text);
    }

    prev.chunk.byte_end = prev_end.max(next.chunk.byte_end);
    prev.chunk.token_count = count_tokens(&prev.chunk.text) as i64;
    prev.chunk.chunk_hash = compute_text_hash(&prev.chunk.text);
    prev.score = prev.score.max(next.score);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, TextChunk};
    use crate::error::Error;
    use crate::index::{InMemoryIndex, IndexEntry};
    use crate::meta::{Document, MetaDb};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Embeds every query as the unit x-axis
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "axis"
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed_batch(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Err(Error::EmbeddingUnavailable("connection refused".to_string()))
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "down"
        }
    }

    /// Claims two dimensions but answers with three
    struct OversizedEmbedder;

    #[async_trait]
    impl Embedder for OversizedEmbedder {
        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "oversized"
        }
    }

    /// Unit vector whose cosine with the x-axis is `score`
    fn at_score(score: f32) -> Vec<f32> {
        vec![score, (1.0 - score * score).sqrt()]
    }

    struct Fixture {
        store: Arc<MetaDb>,
        index: Arc<InMemoryIndex>,
        documents: Vec<String>,
        _tmp: TempDir,
    }

    /// Three documents holding chunks that score 0.9, 0.85, 0.3, 0.2 and 0.1
    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MetaDb::connect_path(&tmp.path().join("r.db")).await.unwrap());
        store.init_schema().await.unwrap();
        let index = Arc::new(InMemoryIndex::new(2));

        let layout: [&[f32]; 3] = [&[0.9, 0.2], &[0.85], &[0.3, 0.1]];
        let mut documents = Vec::new();
        for (d, scores) in layout.iter().enumerate() {
            let text = format!("document {} body text", d);
            let doc = Document::new(format!("doc{}.txt", d), compute_text_hash(&text), text);
            let chunks: Vec<Chunk> = scores
                .iter()
                .enumerate()
                .map(|(i, score)| {
                    let piece = TextChunk {
                        index: i,
                        text: format!("doc {} chunk {}", d, i),
                        token_count: 4,
                        byte_start: 0,
                        byte_end: 0,
                        hash: String::new(),
                    };
                    Chunk::new(&doc.id, &piece, &at_score(*score))
                })
                .collect();
            store.save_document(&doc, &chunks).await.unwrap();
            index
                .insert(
                    chunks
                        .iter()
                        .map(|c| IndexEntry {
                            document_id: c.document_id.clone(),
                            chunk_id: c.id.clone(),
                            chunk_index: c.index(),
                            vector: c.vector(),
                        })
                        .collect(),
                )
                .await
                .unwrap();
            documents.push(doc.id);
        }

        Fixture {
            store,
            index,
            documents,
            _tmp: tmp,
        }
    }

    fn retriever(fx: &Fixture, embedder: Arc<dyn Embedder>, settings: RetrievalConfig) -> Retriever {
        Retriever::new(
            embedder,
            fx.index.clone(),
            fx.store.clone(),
            settings,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_relevance_floor_keeps_high_scores() {
        let fx = fixture().await;
        let settings = RetrievalConfig {
            top_k: 5,
            min_score: Some(0.5),
            merge_adjacent: false,
        };
        let results = retriever(&fx, Arc::new(AxisEmbedder), settings)
            .retrieve("question", &fx.documents, None)
            .await
            .unwrap();

        let scores: Vec<f32> = results.iter().map(|r| (r.score * 100.0).round() / 100.0).collect();
        assert_eq!(scores, vec![0.9, 0.85]);
    }

    #[tokio::test]
    async fn test_without_floor_returns_all_descending() {
        let fx = fixture().await;
        let results = retriever(&fx, Arc::new(AxisEmbedder), RetrievalConfig::default())
            .retrieve("question", &fx.documents, Some(5))
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(results[0].text(), "doc 0 chunk 0");
    }

    #[tokio::test]
    async fn test_scoped_to_linked_documents() {
        let fx = fixture().await;
        let linked = vec![fx.documents[2].clone()];
        let results = retriever(&fx, Arc::new(AxisEmbedder), RetrievalConfig::default())
            .retrieve("question", &linked, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.document_id() == fx.documents[2]));
    }

    #[tokio::test]
    async fn test_empty_links_never_search() {
        let fx = fixture().await;
        // The failing embedder proves no embedding or search happens
        let results = retriever(&fx, Arc::new(DownEmbedder), RetrievalConfig::default())
            .retrieve("question", &[], None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_embedder_failure_surfaces() {
        let fx = fixture().await;
        let err = retriever(&fx, Arc::new(DownEmbedder), RetrievalConfig::default())
            .retrieve("question", &fx.documents, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_wrong_query_dimension_is_embedding_failure() {
        let fx = fixture().await;
        let err = retriever(&fx, Arc::new(OversizedEmbedder), RetrievalConfig::default())
            .retrieve("question", &fx.documents, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_search_all_is_unscoped() {
        let fx = fixture().await;
        let results = retriever(&fx, Arc::new(AxisEmbedder), RetrievalConfig::default())
            .search_all("question", Some(10))
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
    }

    fn retrieved(doc: &str, chunk: &TextChunk, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk::new(doc, chunk, &[1.0]),
            score,
        }
    }

    #[test]
    fn test_merge_adjacent_removes_overlap() {
        let text = "one two three four five six seven eight nine ten";
        let pieces = chunk_text(text, 4, 1).unwrap();

        let results = vec![
            retrieved("doc", &pieces[1], 0.7),
            retrieved("doc", &pieces[0], 0.4),
            retrieved("other", &pieces[0], 0.5),
        ];
        let merged = merge_adjacent(results, usize::MAX);

        let expected = &text[pieces[0].byte_start..pieces[1].byte_end];
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].chunk.document_id, "doc");
        assert_eq!(merged[0].text(), expected);
        assert_eq!(merged[0].chunk.chunk_index, 0);
        assert_eq!(merged[0].tokens(), count_tokens(expected));
        assert!((merged[0].score - 0.7).abs() < 1e-6);
        assert_eq!(merged[1].chunk.document_id, "other");
    }

    #[test]
    fn test_merge_adjacent_chains_runs_and_skips_gaps() {
        let text = "a b c d e f g h i j k l m n o p";
        let pieces = chunk_text(text, 4, 1).unwrap();
        assert!(pieces.len() >= 5);

        let results = vec![
            retrieved("doc", &pieces[0], 0.9),
            retrieved("doc", &pieces[1], 0.8),
            retrieved("doc", &pieces[2], 0.6),
            retrieved("doc", &pieces[4], 0.5),
        ];
        let merged = merge_adjacent(results, usize::MAX);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text(), &text[pieces[0].byte_start..pieces[2].byte_end]);
        assert_eq!(merged[1].chunk.chunk_index, 4);
        assert_eq!(merged[1].text(), pieces[4].text);
    }

    #[test]
    fn test_merge_adjacent_respects_token_limit() {
        let text = "a b c d e f g h i j k l m n o p";
        let pieces = chunk_text(text, 4, 1).unwrap();

        let results = vec![
            retrieved("doc", &pieces[0], 0.9),
            retrieved("doc", &pieces[1], 0.8),
            retrieved("doc", &pieces[2], 0.7),
        ];
        // Room for the first two chunks merged, not for the third on top
        let limit = count_tokens(&text[pieces[0].byte_start..pieces[1].byte_end]);
        let merged = merge_adjacent(results, limit);

        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|r| r.tokens() <= limit));
        assert_eq!(merged[0].text(), &text[pieces[0].byte_start..pieces[1].byte_end]);
        assert_eq!(merged[1].chunk.chunk_index, 2);
        assert_eq!(merged[1].text(), pieces[2].text);
    }
}
