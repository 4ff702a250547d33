//! Status command implementation

use crate::engine::Engine;
use crate::error::Result;
use crate::meta::GlobalStats;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub embedding_backend: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub index_backend: String,
    pub index_connected: bool,
    pub indexed_vectors: usize,
    pub generation_model: String,
    pub token_budget: usize,
    pub db_stats: GlobalStats,
}

/// Get system status
pub async fn cmd_status(engine: &Engine) -> Result<StatusInfo> {
    info!("Getting status");
    let config = &engine.config;

    let db_stats = engine.db.get_global_stats().await?;

    let (index_connected, indexed_vectors) = match engine.index.count().await {
        Ok(count) => (true, count),
        Err(e) => {
            debug!("Index count error: {:?}", e);
            (false, 0)
        }
    };

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        embedding_backend: config.embedding.backend.clone(),
        embedding_model: config.embedding.model.clone(),
        embedding_dimension: config.embedding.dimension,
        index_backend: config.index.backend.clone(),
        index_connected,
        indexed_vectors,
        generation_model: config.generation.model.clone(),
        token_budget: config.context.token_budget,
        db_stats,
    })
}

pub fn print_status(status: &StatusInfo) {
    println!("\n📊 ragchat Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!(
        "\nEmbedding: {} ({}, {} dims)",
        status.embedding_model, status.embedding_backend, status.embedding_dimension
    );
    println!("\nIndex:");
    println!("  Backend: {}", status.index_backend);
    let connection_status = if status.index_connected {
        "✓ Connected"
    } else {
        "✗ Not connected"
    };
    println!("  Status: {}", connection_status);
    println!("  Vectors: {}", status.indexed_vectors);
    println!("\nGeneration Model: {}", status.generation_model);
    println!("Context Budget: {} tokens", status.token_budget);
    println!("\nDatabase Stats:");
    println!("  Documents: {}", status.db_stats.documents);
    println!("  Chunks: {}", status.db_stats.chunks);
    println!("  Conversations: {}", status.db_stats.conversations);
    println!("  Messages: {}", status.db_stats.messages);
}
