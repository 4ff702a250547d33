//! Text generation
//!
//! The LLM is a black box behind [`TextGenerator`]: it receives an assembled
//! [`ContextWindow`] and returns reply text, either whole or as a
//! consume-once stream of fragments.

mod openai;

pub use openai::*;

use crate::config::GenerationConfig;
use crate::context::ContextWindow;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

/// Sampling parameters passed with every request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// A complete reply
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Model that produced the reply, as reported by the backend
    pub model: String,
    /// Total tokens billed for the request, when the backend reports usage
    pub tokens_used: Option<u32>,
}

/// Reply fragments in arrival order. Not restartable.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Trait for text generation backends
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a complete reply for the window
    async fn generate(&self, window: &ContextWindow, params: &GenerationParams)
        -> Result<Generation>;

    /// Generate a reply as a lazy stream of fragments.
    ///
    /// Backends without native streaming yield the whole reply as one fragment.
    async fn generate_stream(
        &self,
        window: &ContextWindow,
        params: &GenerationParams,
    ) -> Result<FragmentStream> {
        let generation = self.generate(window, params).await?;
        Ok(stream::once(async move { Ok(generation.text) }).boxed())
    }

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Create the configured generator
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>> {
    Ok(Arc::new(OpenAiGenerator::new(config)?))
}
