//! Wiring of the collaborators behind the CLI

use crate::config::Config;
use crate::conversation::Orchestrator;
use crate::embed::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::generate::{create_generator, TextGenerator};
use crate::index::{create_index, IndexBackendKind, VectorIndex};
use crate::ingest::Ingestor;
use crate::meta::{MetaDb, Persistence};
use crate::retrieve::Retriever;
use std::sync::Arc;
use tracing::info;

/// Every component of a running engine, built from one config
pub struct Engine {
    pub config: Config,
    pub db: Arc<MetaDb>,
    pub index: Arc<dyn VectorIndex>,
    pub ingestor: Ingestor,
    pub orchestrator: Orchestrator,
}

impl Engine {
    /// Open an initialized data directory with the configured backends
    pub async fn open(config: Config) -> Result<Self> {
        let generator = create_generator(&config.generation)?;
        Self::open_with_generator(config, generator).await
    }

    /// Open with a caller-supplied generator
    pub async fn open_with_generator(
        config: Config,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        if !config.paths.db_file.exists() {
            return Err(Error::NotInitialized);
        }
        let db = Arc::new(MetaDb::connect(&config).await?);
        if !db.is_initialized().await? {
            return Err(Error::NotInitialized);
        }

        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config).await?;
        if config.index.backend.parse::<IndexBackendKind>()? == IndexBackendKind::Memory {
            hydrate_index(db.as_ref(), index.as_ref()).await?;
        }

        let store: Arc<dyn Persistence> = db.clone();
        Self::assemble(config, db, store, embedder, index, generator)
    }

    fn assemble(
        config: Config,
        db: Arc<MetaDb>,
        store: Arc<dyn Persistence>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        let ingestor = Ingestor::from_config(&config, embedder.clone(), index.clone(), store.clone())?;
        let retriever = Retriever::from_config(&config, embedder, index.clone(), store.clone());
        let orchestrator = Orchestrator::new(&config, store, retriever, generator);

        Ok(Self {
            config,
            db,
            index,
            ingestor,
            orchestrator,
        })
    }
}

/// Load every stored vector into a fresh index
pub async fn hydrate_index(store: &dyn Persistence, index: &dyn VectorIndex) -> Result<usize> {
    let entries = store.load_index_entries().await?;
    let count = entries.len();
    if count > 0 {
        index.insert(entries).await?;
    }
    info!("Loaded {} vectors into memory index", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextWindow;
    use crate::generate::{Generation, GenerationParams};
    use crate::meta::ConversationMode;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(
            &self,
            window: &ContextWindow,
            params: &GenerationParams,
        ) -> Result<Generation> {
            Ok(Generation {
                text: format!("echo: {}", window.new_message().unwrap_or_default()),
                model: params.model.clone(),
                tokens_used: None,
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.embedding.backend = "hashing".to_string();
        config.embedding.dimension = 48;
        config.index.backend = "memory".to_string();
        config.chunk.max_tokens = 16;
        config.chunk.overlap_tokens = 4;
        config.context.token_budget = 600;
        config.context.reserved_instruction_tokens = 100;
        config.context.reserved_new_message_tokens = 100;
        config
    }

    async fn init_db(config: &Config) {
        let db = MetaDb::connect(config).await.unwrap();
        db.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_requires_init() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let result = Engine::open_with_generator(config, Arc::new(Echo)).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_reopen_hydrates_memory_index() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        init_db(&config).await;

        let text = "The warehouse in Leeds ships orders every weekday morning. \
            Returns are processed in Bristol within five working days. \
            Damaged goods are photographed before any refund is issued.";

        let doc_id = {
            let engine = Engine::open_with_generator(config.clone(), Arc::new(Echo))
                .await
                .unwrap();
            engine.ingestor.ingest_text("logistics", text).await.unwrap().id
        };

        let engine = Engine::open_with_generator(config, Arc::new(Echo))
            .await
            .unwrap();
        let chunks = engine.db.get_document_chunks(&doc_id).await.unwrap();
        assert_eq!(engine.index.count().await.unwrap(), chunks.len());

        let conversation = engine
            .orchestrator
            .start_conversation(ConversationMode::Rag, None, &[doc_id.clone()])
            .await
            .unwrap();
        let reply = engine
            .orchestrator
            .handle_turn(&conversation.id, "where are returns processed?")
            .await
            .unwrap();

        assert_eq!(reply.reply.content, "echo: where are returns processed?");
        assert!(!reply.sources.is_empty());
        assert!(reply.sources.iter().all(|s| s.document_id() == doc_id));
    }
}
