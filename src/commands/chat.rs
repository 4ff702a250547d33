//! Conversation commands

use crate::conversation::TurnReply;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::meta::{Conversation, ConversationMode, Document, Message};
use std::io::Write;

/// Options for starting a conversation
#[derive(Debug, Clone, Default)]
pub struct NewChatOptions {
    pub rag: bool,
    pub title: Option<String>,
    pub document_ids: Vec<String>,
}

/// Start a conversation
pub async fn cmd_new_chat(engine: &Engine, options: NewChatOptions) -> Result<Conversation> {
    let mode = if options.rag || !options.document_ids.is_empty() {
        ConversationMode::Rag
    } else {
        ConversationMode::OpenChat
    };
    engine
        .orchestrator
        .start_conversation(mode, options.title, &options.document_ids)
        .await
}

/// Send one message. With `stream`, reply fragments are printed as they arrive.
pub async fn cmd_send(
    engine: &Engine,
    conversation_id: &str,
    text: &str,
    stream: bool,
) -> Result<TurnReply> {
    if !stream {
        return engine.orchestrator.handle_turn(conversation_id, text).await;
    }

    let reply = engine
        .orchestrator
        .handle_turn_streaming(conversation_id, text, |fragment| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(fragment.as_bytes());
            let _ = stdout.flush();
        })
        .await?;
    println!();
    Ok(reply)
}

/// Link documents to a RAG conversation
pub async fn cmd_link(
    engine: &Engine,
    conversation_id: &str,
    document_ids: &[String],
) -> Result<Vec<Document>> {
    engine
        .orchestrator
        .link_documents(conversation_id, document_ids)
        .await
}

pub async fn cmd_unlink(engine: &Engine, conversation_id: &str, document_id: &str) -> Result<()> {
    if engine
        .orchestrator
        .unlink_document(conversation_id, document_id)
        .await?
    {
        Ok(())
    } else {
        Err(Error::DocumentNotFound(format!(
            "{} is not linked to conversation {}",
            document_id, conversation_id
        )))
    }
}

pub async fn cmd_history(engine: &Engine, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
    engine.orchestrator.history(conversation_id, limit).await
}

pub async fn cmd_list_conversations(engine: &Engine) -> Result<Vec<Conversation>> {
    engine.orchestrator.list_conversations().await
}

pub async fn cmd_delete_conversation(engine: &Engine, conversation_id: &str) -> Result<()> {
    if engine.orchestrator.delete_conversation(conversation_id).await? {
        Ok(())
    } else {
        Err(Error::ConversationNotFound(conversation_id.to_string()))
    }
}

pub fn print_conversation(conversation: &Conversation) {
    println!("✓ Conversation {} ({})", conversation.id, conversation.mode);
    println!("  Title: {}", conversation.title);
}

/// Print a reply; `streamed` replies were already echoed fragment by fragment
pub fn print_turn(turn: &TurnReply, streamed: bool) {
    if !streamed {
        println!("{}", turn.reply.content);
    }

    if !turn.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in turn.sources.iter().enumerate() {
            println!(
                "  [{}] {} chunk {} (score {:.3})",
                i + 1,
                source.document_id(),
                source.chunk.chunk_index,
                source.score
            );
        }
    }
    println!(
        "\n({} context tokens{})",
        turn.context_tokens,
        turn.tokens_used
            .map(|t| format!(", {} billed", t))
            .unwrap_or_default()
    );
}

pub fn print_linked(documents: &[Document]) {
    if documents.is_empty() {
        println!("No documents linked.");
        return;
    }
    for doc in documents {
        println!("✓ Linked {} ({})", doc.name, doc.id);
    }
}

pub fn print_history(messages: &[Message]) {
    if messages.is_empty() {
        println!("No messages yet.");
        return;
    }
    for message in messages {
        println!(
            "#{} {} [{} tokens]\n{}\n",
            message.sequence,
            message.role.to_uppercase(),
            message.token_count,
            message.content
        );
    }
}

pub fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("No conversations. Use 'ragchat chat new' to start one.");
        return;
    }

    println!("\n💬 Conversations\n");
    for conversation in conversations {
        println!("  {}", conversation.title);
        println!("    ID: {}", conversation.id);
        println!(
            "    Mode: {}  Tokens: {}  Updated: {}",
            conversation.mode, conversation.token_count, conversation.updated_at
        );
    }
}
