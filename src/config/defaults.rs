//! Default values for configuration

/// Default maximum tokens per chunk
pub fn default_chunk_max_tokens() -> usize {
    512
}

/// Default overlap tokens between consecutive chunks
pub fn default_chunk_overlap_tokens() -> usize {
    50
}

/// Default embedding backend kind
pub fn default_embedding_backend() -> String {
    "http".to_string()
}

/// Default embedding backend URL (OpenAI-compatible `/v1/embeddings`)
pub fn default_embedding_url() -> String {
    std::env::var("RAGCHAT_EMBEDDING_URL").unwrap_or_else(|_| "http://127.0.0.1:7997/v1/".to_string())
}

/// Default embedding model (sentence-transformers/all-MiniLM-L6-v2)
pub fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

/// Default embedding dimension (matches the default model)
pub fn default_embedding_dimension() -> usize {
    384
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

/// Default embedding request timeout in seconds
pub fn default_embedding_timeout() -> u64 {
    30
}

/// Default vector index backend
pub fn default_index_backend() -> String {
    "memory".to_string()
}

/// Default Qdrant gRPC URL for local development (port 6334, not 6333 REST)
pub fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default environment variable name for Qdrant API key
pub fn default_qdrant_api_key_env() -> String {
    "".to_string()
}

/// Default collection name
pub fn default_collection_name() -> String {
    "ragchat_chunks".to_string()
}

/// Default number of chunks retrieved per turn
pub fn default_retrieval_top_k() -> usize {
    5
}

/// Default total prompt budget: 80% of a 32k context window
pub fn default_token_budget() -> usize {
    26214
}

/// Default allowance for system instructions
pub fn default_reserved_instruction_tokens() -> usize {
    1024
}

/// Default allowance for the incoming user message
pub fn default_reserved_new_message_tokens() -> usize {
    2048
}

/// Default number of non-fitting messages BEST_EFFORT mode may skip
pub fn default_best_effort_max_skips() -> usize {
    1
}

/// Default number of recent messages loaded before windowing
pub fn default_history_lookback() -> usize {
    100
}

/// Default system instructions
pub fn default_system_prompt() -> String {
    "You are BOT GPT, a helpful and concise enterprise conversational assistant. \
     Your goal is to answer user queries based on conversation history and provided documents. \
     When document context is supplied, prefer it over general knowledge and say so when it does \
     not contain the answer. Be professional and brief."
        .to_string()
}

/// Default chat completions base URL (OpenAI-compatible)
pub fn default_generation_url() -> String {
    std::env::var("RAGCHAT_GENERATION_URL")
        .unwrap_or_else(|_| "https://api.groq.com/openai/v1/".to_string())
}

/// Default generation model
pub fn default_generation_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

/// Default environment variable holding the generation API key
pub fn default_generation_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}

/// Default sampling temperature
pub fn default_generation_temperature() -> f32 {
    0.0
}

/// Default generation request timeout in seconds
pub fn default_generation_timeout() -> u64 {
    60
}
