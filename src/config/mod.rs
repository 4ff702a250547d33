//! Configuration management for ragchat
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::embed::EmbeddingBackendKind;
use crate::error::{Error, Result};
use crate::index::IndexBackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chunking configuration
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Context window configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Text generation configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum tokens per chunk
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    /// Tokens shared between consecutive chunks
    #[serde(default = "default_chunk_overlap_tokens")]
    pub overlap_tokens: usize,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend kind ("http" or "hashing")
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Base URL of the embedding service
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Backend kind ("memory" or "qdrant")
    #[serde(default = "default_index_backend")]
    pub backend: String,

    /// Qdrant connection URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Environment variable name for Qdrant API key
    #[serde(default = "default_qdrant_api_key_env")]
    pub qdrant_api_key_env: String,

    /// Qdrant collection name
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of chunks retrieved per query
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,

    /// Relevance floor; chunks scoring below it are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,

    /// Merge retrieved chunks that are neighbours in the same document
    #[serde(default)]
    pub merge_adjacent: bool,
}

/// History inclusion policy for the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Stop at the first message that does not fit
    #[default]
    Strict,
    /// Skip non-fitting messages and keep scanning older ones
    BestEffort,
}

/// Ordering of evidence segments in the assembled window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOrder {
    /// Most relevant chunk first
    #[default]
    Relevance,
    /// Document order (document, then chunk sequence index)
    Document,
}

/// Context window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum total tokens for an assembled context
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Tokens reserved for system instructions
    #[serde(default = "default_reserved_instruction_tokens")]
    pub reserved_instruction_tokens: usize,

    /// Tokens reserved for the incoming user message
    #[serde(default = "default_reserved_new_message_tokens")]
    pub reserved_new_message_tokens: usize,

    /// Sliding window mode
    #[serde(default)]
    pub window_mode: WindowMode,

    /// How many non-fitting messages BEST_EFFORT may skip before stopping
    #[serde(default = "default_best_effort_max_skips")]
    pub best_effort_max_skips: usize,

    /// Evidence ordering in the assembled window
    #[serde(default)]
    pub evidence_order: EvidenceOrder,

    /// Number of most recent messages loaded as window candidates
    #[serde(default = "default_history_lookback")]
    pub history_lookback: usize,

    /// System instructions placed at the top of every window
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

/// Text generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible chat completions API
    #[serde(default = "default_generation_url")]
    pub url: String,

    /// Model name
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Environment variable name for the API key
    #[serde(default = "default_generation_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature
    #[serde(default = "default_generation_temperature")]
    pub temperature: f32,

    /// Optional cap on completion length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for ragchat data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap_tokens(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key_env: default_qdrant_api_key_env(),
            collection_name: default_collection_name(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_retrieval_top_k(),
            min_score: None,
            merge_adjacent: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            reserved_instruction_tokens: default_reserved_instruction_tokens(),
            reserved_new_message_tokens: default_reserved_new_message_tokens(),
            window_mode: WindowMode::default(),
            best_effort_max_skips: default_best_effort_max_skips(),
            evidence_order: EvidenceOrder::default(),
            history_lookback: default_history_lookback(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_generation_url(),
            model: default_generation_model(),
            api_key_env: default_generation_api_key_env(),
            temperature: default_generation_temperature(),
            max_tokens: None,
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the generation API key from environment
    pub fn api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env).ok()
    }
}

impl ContextConfig {
    /// Sum of the fixed allowances taken off the budget before anything else
    pub fn reserved_tokens(&self) -> usize {
        self.reserved_instruction_tokens + self.reserved_new_message_tokens
    }
}

impl Config {
    /// Get the default base directory for ragchat (~/.ragchat)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ragchat")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub(crate) fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("ragchat.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("ragchat.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Get the Qdrant API key from environment
    pub fn qdrant_api_key(&self) -> Option<String> {
        if self.index.qdrant_api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.index.qdrant_api_key_env).ok()
    }

    /// Check if ragchat is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk.max_tokens == 0 {
            return Err(Error::Config("chunk.max_tokens must be positive".to_string()));
        }

        if self.chunk.overlap_tokens >= self.chunk.max_tokens {
            return Err(Error::Config(
                "chunk.overlap_tokens must be < chunk.max_tokens".to_string(),
            ));
        }

        self.embedding.backend.parse::<EmbeddingBackendKind>()?;
        self.index.backend.parse::<IndexBackendKind>()?;

        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(Error::Config("retrieval.top_k must be positive".to_string()));
        }

        if let Some(min_score) = self.retrieval.min_score {
            if !(-1.0..=1.0).contains(&min_score) {
                return Err(Error::Config(
                    "retrieval.min_score must be between -1.0 and 1.0".to_string(),
                ));
            }
        }

        let reserved = self.context.reserved_tokens();
        if reserved > self.context.token_budget {
            return Err(Error::Config(format!(
                "context reservations ({}) exceed context.token_budget ({})",
                reserved, self.context.token_budget
            )));
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(Error::Config(
                "generation.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }
}
