//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - An HTTP backend for OpenAI-compatible embedding services
//! - A deterministic feature-hashing backend for offline use
//! - Batch and timeout helpers shared by ingestion and retrieval
//!
//! Backends never retry. A failed or timed-out call surfaces as
//! [`Error::EmbeddingUnavailable`] and the caller decides what to do.

mod hashing;
mod http_backend;

pub use hashing::*;
pub use http_backend::*;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Supported embedding backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    Http,
    Hashing,
}

impl FromStr for EmbeddingBackendKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "http" | "https" | "openai-compatible" => Ok(Self::Http),
            "hashing" | "offline" => Ok(Self::Hashing),
            _ => Err(Error::Config(format!(
                "Unsupported embedding backend '{}'; expected 'http' or 'hashing'",
                value
            ))),
        }
    }
}

/// Trait for embedding providers
///
/// Implementations hold no per-request mutable state and may be called
/// concurrently from any number of in-flight operations.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in input order
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingUnavailable("backend returned no embedding".to_string()))
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let kind: EmbeddingBackendKind = config.backend.parse()?;
    debug!("Creating {:?} embedder for model {}", kind, config.model);

    let embedder: Arc<dyn Embedder> = match kind {
        EmbeddingBackendKind::Http => Arc::new(HttpEmbedder::new(config)?),
        EmbeddingBackendKind::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
    };
    Ok(embedder)
}

/// Check a backend response against the request: one vector per input, each of `dimension`
pub fn check_embeddings(
    model: &str,
    expected_count: usize,
    dimension: usize,
    embeddings: &[Vec<f32>],
) -> Result<()> {
    if embeddings.len() != expected_count {
        return Err(Error::EmbeddingUnavailable(format!(
            "model '{}' returned {} embeddings for {} inputs",
            model,
            embeddings.len(),
            expected_count
        )));
    }

    if let Some(mismatch) = embeddings.iter().find(|v| v.len() != dimension) {
        return Err(Error::EmbeddingUnavailable(format!(
            "Embedding dimension mismatch for model '{}': expected {}, got {}",
            model,
            dimension,
            mismatch.len()
        )));
    }

    Ok(())
}

/// Embed one text, treating a timeout or a wrong-sized vector exactly like a
/// backend failure
pub async fn embed_with_timeout(
    embedder: &dyn Embedder,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let vector = match tokio::time::timeout(timeout, embedder.embed(text)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::EmbeddingUnavailable(format!(
                "model '{}' timed out after {:?}",
                embedder.model_name(),
                timeout
            )))
        }
    };
    check_embeddings(
        embedder.model_name(),
        1,
        embedder.dimension(),
        std::slice::from_ref(&vector),
    )?;
    Ok(vector)
}

/// Embed texts in batches, calling `on_batch` with the size of each completed batch
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    batch_size: usize,
    timeout: Duration,
    mut on_batch: impl FnMut(usize) + Send,
) -> Result<Vec<Vec<f32>>> {
    let mut all_embeddings = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size.max(1)) {
        let batch_texts: Vec<String> = batch.to_vec();
        let embeddings = match tokio::time::timeout(timeout, embedder.embed_batch(batch_texts)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::EmbeddingUnavailable(format!(
                    "model '{}' timed out after {:?}",
                    embedder.model_name(),
                    timeout
                )))
            }
        };
        check_embeddings(
            embedder.model_name(),
            batch.len(),
            embedder.dimension(),
            &embeddings,
        )?;
        all_embeddings.extend(embeddings);
        on_batch(batch.len());
    }

    Ok(all_embeddings)
}

/// Scale a vector to unit length (zero vectors are returned unchanged)
pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}
