//! Custom error types for ragchat

use thiserror::Error;

/// Main error type for ragchat operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Document contains no extractable text")]
    EmptyDocument,

    #[error("Document unreadable: {0}")]
    DocumentUnreadable(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Token budget {budget} is smaller than the reserved allowances ({reserved})")]
    BudgetTooSmall { budget: usize, reserved: usize },

    #[error("Message is {tokens} tokens but only {allowance} are reserved for it")]
    MessageTooLong { tokens: usize, allowance: usize },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Qdrant error: {0}")]
    Qdrant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not initialized: run 'ragchat init' first")]
    NotInitialized,

    #[error("Already initialized at {0}")]
    AlreadyInitialized(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is transient and the caller may retry the same request.
    ///
    /// Only collaborator outages qualify; budget and input errors will fail
    /// again until configuration or input changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::EmbeddingUnavailable(_) | Error::Generation(_))
    }
}

impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::Qdrant(err.to_string())
    }
}

/// Result type alias for ragchat operations
pub type Result<T> = std::result::Result<T, Error>;
