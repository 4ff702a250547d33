//! Ingest and document management commands

use crate::engine::Engine;
use crate::error::Result;
use crate::ingest::IngestReport;
use crate::meta::{Document, Persistence};
use std::path::PathBuf;

/// Ingest files and directories
pub async fn cmd_ingest(
    engine: &Engine,
    paths: &[PathBuf],
    concurrency: usize,
) -> Result<IngestReport> {
    Ok(engine.ingestor.ingest_paths(paths, concurrency).await)
}

/// List ingested documents
pub async fn cmd_list_documents(engine: &Engine) -> Result<Vec<Document>> {
    engine.db.list_documents().await
}

/// Delete a document and everything derived from it
pub async fn cmd_delete_document(engine: &Engine, document_id: &str) -> Result<()> {
    engine.ingestor.delete_document(document_id).await
}

pub fn print_ingest_report(report: &IngestReport) {
    println!("\n📥 Ingestion Summary\n");
    for ingested in &report.documents {
        let marker = if ingested.created { "✓" } else { "=" };
        println!(
            "  {} {} ({} chunks) {}",
            marker, ingested.document.name, ingested.document.chunk_count, ingested.document.id
        );
    }
    println!(
        "\nNew: {}  Unchanged: {}  Chunks: {}",
        report.docs_created, report.docs_unchanged, report.chunks_created
    );

    if !report.errors.is_empty() {
        println!("\n⚠ {} errors:", report.errors.len());
        for error in &report.errors {
            println!("  - {}", error);
        }
    }
}

pub fn print_documents(documents: &[Document]) {
    if documents.is_empty() {
        println!("No documents ingested. Use 'ragchat ingest <path>' to add some.");
        return;
    }

    println!("\n📄 Documents\n");
    for doc in documents {
        println!("  {}", doc.name);
        println!("    ID: {}", doc.id);
        println!(
            "    Tokens: {}  Chunks: {}  Added: {}",
            doc.token_count, doc.chunk_count, doc.created_at
        );
    }
}
