//! Document ingestion
//!
//! The pipeline for one document is sequential: extract text, chunk, embed
//! every chunk, persist the document with its chunks, then insert vectors into
//! the index. Independent documents run concurrently with bounded
//! parallelism, and a failure in one never affects another.

use crate::chunk::{compute_content_hash, Chunker};
use crate::config::Config;
use crate::embed::{embed_in_batches, Embedder};
use crate::error::{Error, Result};
use crate::extract::{extractor_for_path, ContentType, TextExtractor};
use crate::index::{IndexEntry, VectorIndex};
use crate::meta::{Chunk, Document, Persistence};
use crate::progress::{advance_progress, finish_progress, start_progress_bar};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Default number of documents ingested at once
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Result of ingesting one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedDocument {
    pub document: Document,
    /// False when identical bytes were already ingested
    pub created: bool,
}

/// Outcome of a batch ingestion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub docs_created: usize,
    pub docs_unchanged: usize,
    pub chunks_created: usize,
    pub documents: Vec<IngestedDocument>,
    pub errors: Vec<String>,
}

impl IngestReport {
    fn record(&mut self, path: &Path, result: Result<IngestedDocument>) {
        match result {
            Ok(ingested) => {
                if ingested.created {
                    self.docs_created += 1;
                    self.chunks_created += ingested.document.chunk_count.max(0) as usize;
                } else {
                    self.docs_unchanged += 1;
                }
                self.documents.push(ingested);
            }
            Err(e) => {
                let error_msg = format!("{}: {}", path.display(), e);
                warn!("{}", error_msg);
                self.errors.push(error_msg);
            }
        }
    }
}

/// Turns documents into stored chunks and indexed vectors
pub struct Ingestor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn Persistence>,
    batch_size: usize,
    embed_timeout: Duration,
    show_progress: bool,
}

impl Ingestor {
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn Persistence>,
    ) -> Result<Self> {
        Ok(Self {
            chunker: Chunker::from_config(&config.chunk)?,
            embedder,
            index,
            store,
            batch_size: config.embedding.batch_size,
            embed_timeout: config.embedding.timeout(),
            show_progress: false,
        })
    }

    /// Show an embedding progress bar per document
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Ingest one file, choosing an extractor from its type
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestedDocument> {
        let extractor = extractor_for_path(path)?;
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        self.ingest_bytes(&name, &bytes, extractor.as_ref()).await
    }

    /// Ingest raw document bytes.
    ///
    /// Identical bytes map to the existing document, so repeating an upload is
    /// a no-op.
    pub async fn ingest_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        extractor: &dyn TextExtractor,
    ) -> Result<IngestedDocument> {
        let content_hash = compute_content_hash(bytes);
        if let Some(document) = self.store.find_document_by_hash(&content_hash).await? {
            debug!(doc_id = %document.id, "Document unchanged: {}", name);
            return Ok(IngestedDocument {
                document,
                created: false,
            });
        }

        let text = extractor.extract_text(bytes).await?;
        let mut document = Document::new(name.to_string(), content_hash, text);
        document.content_type = Some(extractor.content_type().as_mime().to_string());

        let document = self.ingest_document(document).await?;
        Ok(IngestedDocument {
            document,
            created: true,
        })
    }

    /// Ingest text that is already extracted
    pub async fn ingest_text(&self, name: &str, text: &str) -> Result<Document> {
        let content_hash = compute_content_hash(text.as_bytes());
        if let Some(document) = self.store.find_document_by_hash(&content_hash).await? {
            return Ok(document);
        }
        let mut document = Document::new(name.to_string(), content_hash, text.to_string());
        document.content_type = Some(ContentType::PlainText.as_mime().to_string());
        self.ingest_document(document).await
    }

    async fn ingest_document(&self, mut document: Document) -> Result<Document> {
        let pieces = self.chunker.chunk(&document.text)?;
        debug!(
            doc_id = %document.id,
            chunks = pieces.len(),
            "Chunked {}",
            document.name
        );

        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let progress = if self.show_progress {
            start_progress_bar(texts.len(), &format!("Embedding {}", document.name))
        } else {
            None
        };
        let embeddings = embed_in_batches(
            self.embedder.as_ref(),
            texts,
            self.batch_size,
            self.embed_timeout,
            |n| advance_progress(&progress, n),
        )
        .await;
        finish_progress(progress, "Embedded");
        let embeddings = embeddings?;

        let chunks: Vec<Chunk> = pieces
            .iter()
            .zip(embeddings.iter())
            .map(|(piece, vector)| Chunk::new(&document.id, piece, vector))
            .collect();
        document.chunk_count = chunks.len() as i64;

        self.store.save_document(&document, &chunks).await?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| IndexEntry {
                document_id: document.id.clone(),
                chunk_id: chunk.id.clone(),
                chunk_index: chunk.index(),
                vector,
            })
            .collect();

        if let Err(e) = self.index.insert(entries).await {
            // A document without vectors would never be retrieved
            if let Err(cleanup) = self.store.delete_document(&document.id).await {
                warn!(doc_id = %document.id, "Failed to roll back document: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            doc_id = %document.id,
            chunks = document.chunk_count,
            tokens = document.token_count,
            "Ingested {}",
            document.name
        );
        Ok(document)
    }

    /// Ingest files and directories concurrently.
    ///
    /// Directories are walked recursively; hidden entries and unsupported
    /// file types inside them are skipped. Paths given explicitly are always
    /// attempted.
    pub async fn ingest_paths(&self, paths: &[PathBuf], concurrency: usize) -> IngestReport {
        let mut report = IngestReport::default();
        let files = collect_files(paths, &mut report);
        info!("Found {} files to ingest", files.len());

        let results: Vec<(PathBuf, Result<IngestedDocument>)> = stream::iter(files)
            .map(|path| async move {
                let result = self.ingest_file(&path).await;
                (path, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut results = results;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        for (path, result) in results {
            report.record(&path, result);
        }

        info!(
            "Ingestion complete: {} new, {} unchanged, {} chunks, {} errors",
            report.docs_created,
            report.docs_unchanged,
            report.chunks_created,
            report.errors.len()
        );
        report
    }

    /// Delete a document with its chunks, links and index entries
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        if self.store.get_document(document_id).await?.is_none() {
            return Err(Error::DocumentNotFound(document_id.to_string()));
        }
        let removed = self.index.delete(document_id).await?;
        self.store.delete_document(document_id).await?;
        info!(doc_id = %document_id, vectors = removed, "Deleted document");
        Ok(())
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn collect_files(paths: &[PathBuf], report: &mut IngestReport) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            report.errors.push(format!("{}: no such file or directory", path.display()));
            continue;
        }

        let walker = WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            match entry {
                Ok(e) if e.file_type().is_file() => {
                    if ContentType::from_path(e.path()) != ContentType::Unsupported {
                        files.push(e.into_path());
                    } else {
                        debug!("Skipping unsupported file: {}", e.path().display());
                    }
                }
                Ok(_) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }
    }

    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use crate::extract::PlainTextExtractor;
    use crate::index::InMemoryIndex;
    use crate::meta::MetaDb;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const DIM: usize = 32;

    struct Setup {
        ingestor: Ingestor,
        store: Arc<MetaDb>,
        index: Arc<InMemoryIndex>,
        tmp: TempDir,
    }

    async fn setup_with(embedder: Arc<dyn Embedder>, index: Arc<InMemoryIndex>) -> Setup {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MetaDb::connect_path(&tmp.path().join("t.db")).await.unwrap());
        store.init_schema().await.unwrap();

        let mut config = Config::default();
        config.chunk.max_tokens = 12;
        config.chunk.overlap_tokens = 3;
        config.embedding.batch_size = 2;

        let ingestor =
            Ingestor::from_config(&config, embedder, index.clone(), store.clone()).unwrap();
        Setup {
            ingestor,
            store,
            index,
            tmp,
        }
    }

    async fn setup() -> Setup {
        setup_with(
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryIndex::new(DIM)),
        )
        .await
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed_batch(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Err(Error::EmbeddingUnavailable("connection refused".to_string()))
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn model_name(&self) -> &str {
            "down"
        }
    }

    const TEXT: &str = "Quarterly revenue grew by twelve percent. Costs stayed flat across \
        every region. The board approved a new dividend policy. Hiring will resume in the \
        spring. Travel budgets remain frozen until further notice.";

    #[tokio::test]
    async fn test_ingest_persists_chunks_and_vectors() {
        let s = setup().await;
        let extractor = PlainTextExtractor::new(ContentType::PlainText);
        let ingested = s
            .ingestor
            .ingest_bytes("report.txt", TEXT.as_bytes(), &extractor)
            .await
            .unwrap();

        assert!(ingested.created);
        let doc = &ingested.document;
        assert!(doc.chunk_count > 1);
        assert_eq!(doc.content_type.as_deref(), Some("text/plain"));

        let chunks = s.store.get_document_chunks(&doc.id).await.unwrap();
        assert_eq!(chunks.len() as i64, doc.chunk_count);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index(), i);
            assert!(chunk.tokens() <= 12);
            assert_eq!(chunk.vector().len(), DIM);
        }
        assert_eq!(s.index.count().await.unwrap(), chunks.len());
    }

    #[tokio::test]
    async fn test_reingest_same_bytes_is_noop() {
        let s = setup().await;
        let extractor = PlainTextExtractor::new(ContentType::PlainText);
        let first = s
            .ingestor
            .ingest_bytes("a.txt", TEXT.as_bytes(), &extractor)
            .await
            .unwrap();
        let second = s
            .ingestor
            .ingest_bytes("b.txt", TEXT.as_bytes(), &extractor)
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(first.document.id, second.document.id);
        assert_eq!(s.store.list_documents().await.unwrap().len(), 1);
        assert_eq!(
            s.index.count().await.unwrap() as i64,
            first.document.chunk_count
        );
    }

    #[tokio::test]
    async fn test_embedding_failure_persists_nothing() {
        let s = setup_with(Arc::new(DownEmbedder), Arc::new(InMemoryIndex::new(DIM))).await;
        let err = s.ingestor.ingest_text("report", TEXT).await.unwrap_err();

        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
        assert!(s.store.list_documents().await.unwrap().is_empty());
        assert_eq!(s.index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_document() {
        // Index dimension disagrees with the embedder
        let s = setup_with(
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryIndex::new(DIM / 2)),
        )
        .await;
        let err = s.ingestor.ingest_text("report", TEXT).await.unwrap_err();

        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert!(s.store.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_paths_isolates_failures() {
        let s = setup().await;
        let dir = s.tmp.path().join("docs");
        std::fs::create_dir_all(dir.join(".hidden")).unwrap();
        std::fs::write(dir.join("good.txt"), TEXT).unwrap();
        std::fs::write(dir.join("notes.md"), "# Notes\n\nShip the release on Friday.").unwrap();
        std::fs::write(dir.join("blank.txt"), "   \n\n  ").unwrap();
        std::fs::write(dir.join("binary.txt"), [b'a', 0, b'b']).unwrap();
        std::fs::write(dir.join("image.png"), [0x89, b'P', b'N', b'G']).unwrap();
        std::fs::write(dir.join(".hidden/secret.txt"), "do not ingest").unwrap();

        let missing = s.tmp.path().join("missing.txt");
        let report = s
            .ingestor
            .ingest_paths(&[dir, missing], 3)
            .await;

        assert_eq!(report.docs_created, 2);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors.iter().any(|e| e.contains("blank.txt")));
        assert!(report.errors.iter().any(|e| e.contains("binary.txt")));
        assert!(report.errors.iter().any(|e| e.contains("missing.txt")));

        let names: Vec<String> = s
            .store
            .list_documents()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"good.txt".to_string()));
        assert!(names.contains(&"notes.md".to_string()));
    }

    #[tokio::test]
    async fn test_delete_document_removes_vectors() {
        let s = setup().await;
        let doc = s.ingestor.ingest_text("report", TEXT).await.unwrap();
        let other = s
            .ingestor
            .ingest_text("memo", "Lunch is served at noon on Fridays.")
            .await
            .unwrap();

        s.ingestor.delete_document(&doc.id).await.unwrap();

        assert!(s.store.get_document(&doc.id).await.unwrap().is_none());
        assert_eq!(s.index.count().await.unwrap() as i64, other.chunk_count);
        assert!(matches!(
            s.ingestor.delete_document(&doc.id).await,
            Err(Error::DocumentNotFound(_))
        ));
    }
}
