//! Conversation orchestration
//!
//! Drives one turn at a time through
//! `AwaitingInput -> Retrieving -> AssemblingContext -> Generating -> Persisting`.
//! Any failure returns the turn to `AwaitingInput` with nothing persisted.
//! The user message and the reply are appended together in one atomic
//! write after generation succeeds, so a cancelled or failed turn leaves no
//! trace in history.
//!
//! Turns on the same conversation are serialized with a per-conversation
//! lock; turns on different conversations run in parallel.

use crate::config::Config;
use crate::context::{ContextWindow, ContextWindowManager};
use crate::error::{Error, Result};
use crate::generate::{Generation, GenerationParams, TextGenerator};
use crate::meta::{
    Conversation, ConversationMode, Document, Message, NewMessage, Persistence,
};
use crate::retrieve::{RetrievedChunk, Retriever};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TITLE_MAX_CHARS: usize = 60;

/// Turn lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    Retrieving,
    AssemblingContext,
    Generating,
    Persisting,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::AwaitingInput => "awaiting_input",
            TurnState::Retrieving => "retrieving",
            TurnState::AssemblingContext => "assembling_context",
            TurnState::Generating => "generating",
            TurnState::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Result of a completed turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    /// The persisted assistant message
    pub reply: Message,
    /// The persisted user message
    pub user_message: Message,
    /// Evidence that made it into the context window
    pub sources: Vec<RetrievedChunk>,
    /// Token cost of the assembled context
    pub context_tokens: usize,
    /// Tokens billed by the generator, when reported
    pub tokens_used: Option<u32>,
}

/// Everything a turn needs once context assembly is done
struct PreparedTurn {
    conversation: Conversation,
    window: ContextWindow,
    sources: Vec<RetrievedChunk>,
}

/// Runs conversation turns against the engine components
pub struct Orchestrator {
    store: Arc<dyn Persistence>,
    retriever: Retriever,
    windows: ContextWindowManager,
    generator: Arc<dyn TextGenerator>,
    params: GenerationParams,
    token_budget: usize,
    history_lookback: usize,
    generation_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn Persistence>,
        retriever: Retriever,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            store,
            retriever,
            windows: ContextWindowManager::new(config.context.clone()),
            generator,
            params: GenerationParams::from_config(&config.generation),
            token_budget: config.context.token_budget,
            history_lookback: config.context.history_lookback,
            generation_timeout: config.generation.timeout(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Create a conversation, linking documents when it is a RAG conversation
    pub async fn start_conversation(
        &self,
        mode: ConversationMode,
        title: Option<String>,
        document_ids: &[String],
    ) -> Result<Conversation> {
        if mode == ConversationMode::OpenChat && !document_ids.is_empty() {
            return Err(Error::InvalidInput(
                "open chat conversations cannot link documents".to_string(),
            ));
        }

        let conversation = Conversation::new(mode, title);
        self.store.create_conversation(&conversation).await?;
        info!("Started {} conversation {}", mode, conversation.id);

        if !document_ids.is_empty() {
            self.link_documents(&conversation.id, document_ids).await?;
        }
        Ok(conversation)
    }

    /// Link existing documents to a RAG conversation; unknown ids are skipped.
    /// Returns the documents that were linked.
    pub async fn link_documents(
        &self,
        conversation_id: &str,
        document_ids: &[String],
    ) -> Result<Vec<Document>> {
        let conversation = self.require_conversation(conversation_id).await?;
        if conversation.get_mode()? != ConversationMode::Rag {
            return Err(Error::InvalidInput(format!(
                "conversation {} is open chat; documents can only be linked to RAG conversations",
                conversation_id
            )));
        }

        let mut found = Vec::with_capacity(document_ids.len());
        for id in document_ids {
            match self.store.get_document(id).await? {
                Some(document) => found.push(document),
                None => warn!("Skipping unknown document {}", id),
            }
        }

        let ids: Vec<String> = found.iter().map(|d| d.id.clone()).collect();
        self.store.link_documents(conversation_id, &ids).await?;
        info!(
            "Linked {} documents to conversation {}",
            ids.len(),
            conversation_id
        );
        Ok(found)
    }

    /// Remove a document link. Later turns stop retrieving from it.
    pub async fn unlink_document(&self, conversation_id: &str, document_id: &str) -> Result<bool> {
        self.require_conversation(conversation_id).await?;
        let removed = self.store.unlink_document(conversation_id, document_id).await?;
        if removed {
            info!("Unlinked document {} from conversation {}", document_id, conversation_id);
        }
        Ok(removed)
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.store.list_conversations().await
    }

    pub async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.require_conversation(conversation_id).await?;
        self.store.load_recent_messages(conversation_id, limit).await
    }

    /// Delete a conversation with its messages and links. Waits for any
    /// in-flight turn on it to finish.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;
        let deleted = self.store.delete_conversation(conversation_id).await?;
        self.locks.lock().await.remove(conversation_id);
        Ok(deleted)
    }

    /// Run one turn and return the persisted reply
    pub async fn handle_turn(&self, conversation_id: &str, user_text: &str) -> Result<TurnReply> {
        let lock = self.conversation_lock(conversation_id).await;
        let guard = lock.lock().await;

        let mut state = TurnState::AwaitingInput;
        let result = self.run_turn(conversation_id, user_text, &mut state).await;
        let reply = self.finish(conversation_id, state, result);

        drop(guard);
        self.release_lock(conversation_id, lock).await;
        reply
    }

    /// Run one turn, forwarding reply fragments to `sink` as they arrive.
    /// Only the complete reply is persisted.
    pub async fn handle_turn_streaming<F>(
        &self,
        conversation_id: &str,
        user_text: &str,
        sink: F,
    ) -> Result<TurnReply>
    where
        F: FnMut(&str) + Send,
    {
        let lock = self.conversation_lock(conversation_id).await;
        let guard = lock.lock().await;

        let mut state = TurnState::AwaitingInput;
        let result = self
            .run_streaming_turn(conversation_id, user_text, sink, &mut state)
            .await;
        let reply = self.finish(conversation_id, state, result);

        drop(guard);
        self.release_lock(conversation_id, lock).await;
        reply
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        state: &mut TurnState,
    ) -> Result<TurnReply> {
        let prepared = self.prepare(conversation_id, user_text, state).await?;

        transition(state, TurnState::Generating, conversation_id);
        let generation = tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate(&prepared.window, &self.params),
        )
        .await
        .map_err(|_| self.timeout_error())??;

        self.persist(prepared, user_text, generation, state).await
    }

    async fn run_streaming_turn<F>(
        &self,
        conversation_id: &str,
        user_text: &str,
        mut sink: F,
        state: &mut TurnState,
    ) -> Result<TurnReply>
    where
        F: FnMut(&str) + Send,
    {
        let prepared = self.prepare(conversation_id, user_text, state).await?;

        transition(state, TurnState::Generating, conversation_id);
        let collect = async {
            let mut fragments = self
                .generator
                .generate_stream(&prepared.window, &self.params)
                .await?;
            let mut text = String::new();
            while let Some(fragment) = fragments.next().await {
                let fragment = fragment?;
                sink(&fragment);
                text.push_str(&fragment);
            }
            Ok::<_, Error>(text)
        };
        let text = tokio::time::timeout(self.generation_timeout, collect)
            .await
            .map_err(|_| self.timeout_error())??;

        let generation = Generation {
            text,
            model: self.params.model.clone(),
            tokens_used: None,
        };
        self.persist(prepared, user_text, generation, state).await
    }

    /// Retrieval and context assembly
    async fn prepare(
        &self,
        conversation_id: &str,
        user_text: &str,
        state: &mut TurnState,
    ) -> Result<PreparedTurn> {
        let conversation = self.require_conversation(conversation_id).await?;
        let mode = conversation.get_mode()?;

        let evidence = match mode {
            ConversationMode::Rag => {
                transition(state, TurnState::Retrieving, conversation_id);
                let linked = self.store.load_linked_documents(conversation_id).await?;
                if linked.is_empty() {
                    warn!("No documents linked to conversation {}", conversation_id);
                }
                self.retriever.retrieve(user_text, &linked, None).await?
            }
            ConversationMode::OpenChat => Vec::new(),
        };

        transition(state, TurnState::AssemblingContext, conversation_id);
        let history = self
            .store
            .load_recent_messages(conversation_id, self.history_lookback)
            .await?;
        let window = self
            .windows
            .build(&history, &evidence, user_text, self.token_budget)?;

        let included: Vec<&str> = window
            .evidence()
            .filter_map(|s| match s {
                crate::context::Segment::Evidence { chunk_id, .. } => Some(chunk_id.as_str()),
                _ => None,
            })
            .collect();
        let sources = evidence
            .iter()
            .filter(|c| included.contains(&c.chunk.id.as_str()))
            .cloned()
            .collect();

        Ok(PreparedTurn {
            conversation,
            window,
            sources,
        })
    }

    async fn persist(
        &self,
        prepared: PreparedTurn,
        user_text: &str,
        generation: Generation,
        state: &mut TurnState,
    ) -> Result<TurnReply> {
        if generation.text.trim().is_empty() {
            return Err(Error::Generation("model returned an empty reply".to_string()));
        }

        let conversation_id = prepared.conversation.id.as_str();
        transition(state, TurnState::Persisting, conversation_id);

        let mut stored = self
            .store
            .append_messages(
                conversation_id,
                &[
                    NewMessage::user(user_text),
                    NewMessage::assistant(generation.text, Some(generation.model)),
                ],
            )
            .await?;

        let (reply, user_message) = match (stored.pop(), stored.pop()) {
            (Some(reply), Some(user_message)) => (reply, user_message),
            _ => return Err(Error::Other("append returned too few messages".to_string())),
        };

        if prepared.conversation.has_default_title() {
            let title = derive_title(user_text);
            if let Err(e) = self.store.rename_conversation(conversation_id, &title).await {
                warn!("Failed to set title for conversation {}: {}", conversation_id, e);
            }
        }

        Ok(TurnReply {
            reply,
            user_message,
            sources: prepared.sources,
            context_tokens: prepared.window.total_tokens(),
            tokens_used: generation.tokens_used,
        })
    }

    fn finish(
        &self,
        conversation_id: &str,
        mut state: TurnState,
        result: Result<TurnReply>,
    ) -> Result<TurnReply> {
        match &result {
            Ok(turn) => info!(
                "Turn complete for conversation {} (message #{}, {} context tokens)",
                conversation_id, turn.reply.sequence, turn.context_tokens
            ),
            Err(e) => warn!(
                "Turn aborted during {} for conversation {}: {}",
                state, conversation_id, e
            ),
        }
        transition(&mut state, TurnState::AwaitingInput, conversation_id);
        result
    }

    fn timeout_error(&self) -> Error {
        Error::Generation(format!(
            "{} timed out after {:?}",
            self.generator.name(),
            self.generation_timeout
        ))
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry once no other turn holds or waits on the mutex
    async fn release_lock(&self, conversation_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let ours = locks
            .get(conversation_id)
            .map_or(false, |held| Arc::ptr_eq(held, &lock));
        // One reference in the map, one here
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(conversation_id);
        }
    }
}

fn transition(state: &mut TurnState, next: TurnState, conversation_id: &str) {
    debug!("Conversation {}: {} -> {}", conversation_id, state, next);
    *state = next;
}

/// Title from the first user message: whitespace collapsed, cut at a char boundary
pub fn derive_title(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}
