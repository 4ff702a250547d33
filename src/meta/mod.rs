//! Persistence using SQLite
//!
//! This module stores everything that outlives a process:
//! - Documents (extracted text) and their chunks with embeddings
//! - Conversations, their document links, and messages
//!
//! Core components only talk to the [`Persistence`] trait; [`MetaDb`] is the
//! SQLite implementation. Multi-row writes run in a single transaction.

mod records;
mod schema;

pub use records::*;
pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::IndexEntry;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Logical operations the engine needs from durable storage
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a document and all of its chunks atomically
    async fn save_document(&self, document: &Document, chunks: &[Chunk]) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Delete a document, its chunks and any conversation links to it
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Fetch chunks by id, returned in the order requested (missing ids are skipped)
    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Every stored chunk vector, for rebuilding an in-memory index
    async fn load_index_entries(&self) -> Result<Vec<IndexEntry>>;

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Conversations, most recently updated first
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Delete a conversation with its messages and links; documents are untouched
    async fn delete_conversation(&self, id: &str) -> Result<bool>;

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<()>;

    async fn link_documents(&self, conversation_id: &str, document_ids: &[String]) -> Result<()>;

    async fn unlink_document(&self, conversation_id: &str, document_id: &str) -> Result<bool>;

    /// Ids of documents linked to a conversation, in link order
    async fn load_linked_documents(&self, conversation_id: &str) -> Result<Vec<String>>;

    /// Append messages atomically, assigning the next sequence numbers and
    /// adding their tokens to the conversation total
    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<Message>>;

    async fn append_message(&self, conversation_id: &str, message: &NewMessage) -> Result<Message> {
        self.append_messages(conversation_id, std::slice::from_ref(message))
            .await?
            .pop()
            .ok_or_else(|| Error::Other("append returned no message".to_string()))
    }

    /// The `limit` most recent messages in chronological order
    async fn load_recent_messages(&self, conversation_id: &str, limit: usize)
        -> Result<Vec<Message>>;
}

/// Aggregate row counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub documents: i64,
    pub chunks: i64,
    pub conversations: i64,
    pub messages: i64,
}

/// SQLite database handle
#[derive(Debug, Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the database at the configured path
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::connect_path(&config.paths.db_file).await
    }

    /// Connect to a database file, creating it if missing
    pub async fn connect_path(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='messages'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    /// Chunks of one document in sequence order
    pub async fn get_document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let chunks = sqlx::query_as::<_, Chunk>(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    /// Row counts across all tables
    pub async fn get_global_stats(&self) -> Result<GlobalStats> {
        let (documents, chunks, conversations, messages): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents),
                (SELECT COUNT(*) FROM chunks),
                (SELECT COUNT(*) FROM conversations),
                (SELECT COUNT(*) FROM messages)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(GlobalStats {
            documents,
            chunks,
            conversations,
            messages,
        })
    }
}

#[async_trait]
impl Persistence for MetaDb {
    async fn save_document(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, name, content_hash, content_type, text, token_count, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.name)
        .bind(&document.content_hash)
        .bind(&document.content_type)
        .bind(&document.text)
        .bind(document.token_count)
        .bind(chunks.len() as i64)
        .bind(&document.created_at)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, token_count, byte_start, byte_end, chunk_hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.byte_start)
            .bind(chunk.byte_end)
            .bind(&chunk.chunk_hash)
            .bind(&chunk.embedding)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Saved document {} with {} chunks",
            document.id,
            chunks.len()
        );
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc)
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc)
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>("SELECT * FROM documents ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(docs)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM conversation_documents WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("SELECT * FROM chunks WHERE id IN ({})", placeholders);

        let mut query_builder = sqlx::query_as::<_, Chunk>(&query);
        for id in ids {
            query_builder = query_builder.bind(id);
        }
        let rows = query_builder.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<String, Chunk> =
            rows.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn load_index_entries(&self) -> Result<Vec<IndexEntry>> {
        let rows: Vec<(String, String, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT id, document_id, chunk_index, embedding FROM chunks ORDER BY document_id, chunk_index",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(chunk_id, document_id, chunk_index, embedding)| IndexEntry {
                document_id,
                chunk_id,
                chunk_index: chunk_index.max(0) as usize,
                vector: blob_to_vector(&embedding),
            })
            .collect())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, mode, token_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(&conversation.mode)
        .bind(conversation.token_count)
        .bind(&conversation.created_at)
        .bind(&conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(conversation)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations ORDER BY updated_at DESC, created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(conversations)
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversation_documents WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn link_documents(&self, conversation_id: &str, document_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        for document_id in document_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO conversation_documents (conversation_id, document_id, linked_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(document_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unlink_document(&self, conversation_id: &str, document_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM conversation_documents WHERE conversation_id = ? AND document_id = ?",
        )
        .bind(conversation_id)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_linked_documents(&self, conversation_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT document_id FROM conversation_documents WHERE conversation_id = ? ORDER BY linked_at, document_id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<Message>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let token_delta: i64 = messages.iter().map(|m| m.token_count as i64).sum();
        let updated = sqlx::query(
            "UPDATE conversations SET token_count = token_count + ?, updated_at = ? WHERE id = ?",
        )
        .bind(token_delta)
        .bind(&now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::ConversationNotFound(conversation_id.to_string()));
        }

        let last_sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut stored = Vec::with_capacity(messages.len());
        for (offset, message) in messages.iter().enumerate() {
            let record = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sequence: last_sequence + offset as i64 + 1,
                role: message.role.to_string(),
                content: message.content.clone(),
                token_count: message.token_count as i64,
                model: message.model.clone(),
                created_at: now.clone(),
            };

            sqlx::query(
                r#"
                INSERT INTO messages (id, conversation_id, sequence, role, content, token_count, model, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.conversation_id)
            .bind(record.sequence)
            .bind(&record.role)
            .bind(&record.content)
            .bind(record.token_count)
            .bind(&record.model)
            .bind(&record.created_at)
            .execute(&mut *tx)
            .await?;

            stored.push(record);
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn load_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE conversation_id = ? ORDER BY sequence DESC LIMIT ?
            ) ORDER BY sequence ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
