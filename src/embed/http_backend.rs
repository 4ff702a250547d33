use super::{check_embeddings, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Data { data: Vec<EmbeddingData> },
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Data { mut data } => {
                // OpenAI-style responses carry an explicit index per input
                if data.iter().all(|d| d.index.is_some()) {
                    data.sort_by_key(|d| d.index);
                }
                data.into_iter().map(|d| d.embedding).collect()
            }
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
        }
    }
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint
pub struct HttpEmbedder {
    client: Client,
    endpoint: Url,
    model_id: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.url)?;
        let endpoint = base_url
            .join("embeddings")
            .map_err(|e| Error::Config(format!("Invalid embedding backend URL: {}", e)))?;
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            endpoint,
            model_id: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

/// Parse a base URL, adding the trailing slash `Url::join` needs to keep the last segment
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model_id,
            input: &texts,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingUnavailable(format!("malformed response: {}", e)))?;

        let embeddings = parsed.into_embeddings();
        check_embeddings(&self.model_id, texts.len(), self.dimension, &embeddings)?;
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}
