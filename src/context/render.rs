//! Rendering a context window for a chat completion API

use super::{ContextWindow, Segment};
use serde::{Deserialize, Serialize};

/// A chat message in the OpenAI wire shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

const EVIDENCE_HEADER: &str = "RAG CONTEXT:\n---\n";
const EVIDENCE_FOOTER: &str = "\n---";

impl ContextWindow {
    /// System text: instructions followed by the evidence block, if any
    pub fn system_text(&self) -> String {
        let mut system = self.instructions().unwrap_or_default().to_string();

        let blocks: Vec<String> = self
            .evidence()
            .enumerate()
            .filter_map(|(n, segment)| match segment {
                Segment::Evidence {
                    chunk_index, text, ..
                } => Some(format!("[Source {} | chunk {}]\n{}", n + 1, chunk_index, text)),
                _ => None,
            })
            .collect();

        if !blocks.is_empty() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(EVIDENCE_HEADER);
            system.push_str(&blocks.join("\n\n"));
            system.push_str(EVIDENCE_FOOTER);
        }
        system
    }

    /// Chat messages: one system message, the history turns, then the new user message
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new("system", self.system_text())];

        for segment in &self.segments {
            match segment {
                Segment::History { role, text, .. } => {
                    messages.push(ChatMessage::new(role.as_str(), text.clone()))
                }
                Segment::NewMessage { text, .. } => {
                    messages.push(ChatMessage::new("user", text.clone()))
                }
                Segment::Instructions { .. } | Segment::Evidence { .. } => {}
            }
        }
        messages
    }

    /// Whole window as one plain-text prompt
    pub fn render(&self) -> String {
        let mut out = self.system_text();
        for message in self.to_chat_messages().into_iter().skip(1) {
            out.push_str(&format!("\n\n{}: {}", message.role.to_uppercase(), message.content));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MessageRole;

    fn window() -> ContextWindow {
        ContextWindow {
            segments: vec![
                Segment::Instructions {
                    text: "Be brief.".to_string(),
                    tokens: 2,
                },
                Segment::Evidence {
                    chunk_id: "c1".to_string(),
                    document_id: "d".to_string(),
                    chunk_index: 4,
                    score: 0.8,
                    text: "Revenue grew.".to_string(),
                    tokens: 2,
                },
                Segment::History {
                    sequence: 1,
                    role: MessageRole::User,
                    text: "hi".to_string(),
                    tokens: 1,
                },
                Segment::History {
                    sequence: 2,
                    role: MessageRole::Assistant,
                    text: "hello".to_string(),
                    tokens: 1,
                },
                Segment::NewMessage {
                    text: "how did revenue do?".to_string(),
                    tokens: 4,
                },
            ],
            token_budget: 100,
            omitted_chunks: 0,
            omitted_messages: 0,
        }
    }

    #[test]
    fn test_chat_messages_layout() {
        let messages = window().to_chat_messages();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);

        let system = &messages[0].content;
        assert!(system.starts_with("Be brief.\n\nRAG CONTEXT:\n---\n"));
        assert!(system.contains("[Source 1 | chunk 4]\nRevenue grew."));
        assert!(system.ends_with("\n---"));
        assert_eq!(messages[3].content, "how did revenue do?");
    }

    #[test]
    fn test_no_evidence_block_without_evidence() {
        let mut w = window();
        w.segments.retain(|s| !s.is_evidence());
        assert_eq!(w.system_text(), "Be brief.");
        assert!(w.render().ends_with("USER: how did revenue do?"));
    }
}
