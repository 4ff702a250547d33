//! Row types for the ragchat database

use crate::error::{Error, Result};
use crate::tokens::count_tokens;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for deterministic chunk ids
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_93a2_5b7e_4d0c_9a41_2e8f_d3b6_7c15);

/// Default title for conversations that have not been named yet
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

/// Conversation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Free conversation with no linked documents
    OpenChat,
    /// Answers grounded in linked documents
    Rag,
}

impl std::fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationMode::OpenChat => write!(f, "open_chat"),
            ConversationMode::Rag => write!(f, "rag"),
        }
    }
}

impl FromStr for ConversationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open_chat" | "open" => Ok(ConversationMode::OpenChat),
            "rag" | "rag_chat" => Ok(ConversationMode::Rag),
            _ => Err(Error::InvalidInput(format!("Unknown conversation mode: {}", s))),
        }
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(Error::InvalidInput(format!("Unknown message role: {}", s))),
        }
    }
}

/// An ingested document
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub content_hash: String,
    pub content_type: Option<String>,
    #[serde(skip_serializing)]
    pub text: String,
    pub token_count: i64,
    pub chunk_count: i64,
    pub created_at: String,
}

impl Document {
    pub fn new(name: String, content_hash: String, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            content_hash,
            content_type: None,
            token_count: count_tokens(&text) as i64,
            text,
            chunk_count: 0,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A stored chunk with its embedding
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub byte_start: i64,
    pub byte_end: i64,
    pub chunk_hash: String,
    #[serde(skip)]
    pub embedding: Vec<u8>,
}

impl Chunk {
    /// Deterministic chunk id for a document position
    pub fn id_for(document_id: &str, chunk_index: usize) -> String {
        Uuid::new_v5(
            &CHUNK_NAMESPACE,
            format!("{}:{}", document_id, chunk_index).as_bytes(),
        )
        .to_string()
    }

    pub fn new(document_id: &str, chunk: &crate::chunk::TextChunk, vector: &[f32]) -> Self {
        Self {
            id: Self::id_for(document_id, chunk.index),
            document_id: document_id.to_string(),
            chunk_index: chunk.index as i64,
            text: chunk.text.clone(),
            token_count: chunk.token_count as i64,
            byte_start: chunk.byte_start as i64,
            byte_end: chunk.byte_end as i64,
            chunk_hash: chunk.hash.clone(),
            embedding: vector_to_blob(vector),
        }
    }

    pub fn vector(&self) -> Vec<f32> {
        blob_to_vector(&self.embedding)
    }

    pub fn index(&self) -> usize {
        self.chunk_index.max(0) as usize
    }

    pub fn tokens(&self) -> usize {
        self.token_count.max(0) as usize
    }
}

/// A conversation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub mode: String,
    pub token_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn new(mode: ConversationMode, title: Option<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string()),
            mode: mode.to_string(),
            token_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn get_mode(&self) -> Result<ConversationMode> {
        self.mode.parse()
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_CONVERSATION_TITLE
    }
}

/// A persisted message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub role: String,
    pub content: String,
    pub token_count: i64,
    pub model: Option<String>,
    pub created_at: String,
}

impl Message {
    pub fn get_role(&self) -> Result<MessageRole> {
        self.role.parse()
    }

    pub fn tokens(&self) -> usize {
        self.token_count.max(0) as usize
    }
}

/// A message not yet persisted; ids and sequence numbers are assigned on append
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub token_count: usize,
    pub model: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role: MessageRole::User,
            token_count: count_tokens(&content),
            content,
            model: None,
        }
    }

    pub fn assistant(content: impl Into<String>, model: Option<String>) -> Self {
        let content = content.into();
        Self {
            role: MessageRole::Assistant,
            token_count: count_tokens(&content),
            content,
            model,
        }
    }
}

/// Encode a vector as little-endian f32 bytes
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes (trailing partial values are ignored)
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
