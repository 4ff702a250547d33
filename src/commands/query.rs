//! Retrieval diagnostics

use crate::engine::Engine;
use crate::error::Result;
use crate::retrieve::RetrievedChunk;
use serde::Serialize;
use tracing::info;

/// Query result
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub results: Vec<RetrievedChunk>,
}

/// Search all documents, or only `document_ids` when given
pub async fn cmd_query(
    engine: &Engine,
    query: &str,
    document_ids: &[String],
    top_k: Option<usize>,
) -> Result<QueryResult> {
    info!("Querying: {}", query);
    let retriever = engine.orchestrator.retriever();

    let results = if document_ids.is_empty() {
        retriever.search_all(query, top_k).await?
    } else {
        retriever.retrieve(query, document_ids, top_k).await?
    };

    Ok(QueryResult {
        query: query.to_string(),
        results,
    })
}

fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > max_chars {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        trimmed.to_string()
    }
}

pub fn print_query_results(result: &QueryResult) {
    println!("\n🔍 Query: {}\n", result.query);
    println!("Found {} results:\n", result.results.len());

    for (i, r) in result.results.iter().enumerate() {
        println!(
            "{}. [score: {:.3}] {} (chunk {})",
            i + 1,
            r.score,
            r.document_id(),
            r.chunk.chunk_index
        );
        println!("   {}\n", preview(r.text(), 200).replace('\n', " "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::TextChunk;
    use crate::meta::Chunk;

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("  short  ", 10), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_query_result_json() {
        let piece = TextChunk {
            index: 3,
            text: "returns are processed in Bristol".to_string(),
            token_count: 5,
            byte_start: 10,
            byte_end: 42,
            hash: "abc".to_string(),
        };
        let result = QueryResult {
            query: "where are returns processed?".to_string(),
            results: vec![RetrievedChunk {
                chunk: Chunk::new("doc-1", &piece, &[0.5, 0.5]),
                score: 0.75,
            }],
        };

        let json = serde_json::to_value(&result).unwrap();
        let hit = &json["results"][0];
        assert_eq!(json["query"], "where are returns processed?");
        assert_eq!(hit["document_id"], "doc-1");
        assert_eq!(hit["chunk_index"], 3);
        assert_eq!(hit["score"], 0.75);
        assert!(hit.get("embedding").is_none());
    }
}
