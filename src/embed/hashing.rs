//! Feature-hashing embedder
//!
//! Maps lowercased words (and adjacent word pairs) into a fixed number of
//! signed buckets with blake3, then L2-normalizes. No model download, no
//! network: useful for offline runs and tests. Texts sharing vocabulary score
//! high cosine similarity; it carries no semantics beyond that.

use super::{normalize_embedding, Embedder};
use crate::error::Result;
use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

const MODEL_NAME: &str = "feature-hashing";

/// Deterministic bag-of-words embedder
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed synchronously; the async trait methods delegate here
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text.unicode_words().map(|w| w.to_lowercase()).collect();

        for word in &words {
            self.add_feature(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, feature.as_bytes(), 0.5);
        }

        normalize_embedding(&vector)
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = blake3::hash(feature);
        let bytes = hash.as_bytes();
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }
}
