//! Context window assembly
//!
//! Every budget decision for a prompt is made here. A window is built in
//! four passes:
//!
//! 1. The instruction and new-message allowances come off the budget first.
//! 2. Retrieved chunks are added in relevance order until the next one no
//!    longer fits. Chunks are never truncated.
//! 3. The rest of the budget takes history, newest message first, stopping
//!    at the first miss ([`WindowMode::Strict`]) or skipping a bounded number
//!    of misses ([`WindowMode::BestEffort`]).
//! 4. Segments are laid out as instructions, evidence, history (oldest
//!    first), then the new message.
//!
//! Costs are counted with [`crate::tokens::count_tokens`], the same unit the
//! chunker uses.

mod render;

pub use render::*;

use crate::config::{ContextConfig, EvidenceOrder, WindowMode};
use crate::error::{Error, Result};
use crate::meta::{Message, MessageRole};
use crate::retrieve::RetrievedChunk;
use crate::tokens::count_tokens;
use serde::Serialize;
use tracing::{debug, info};

/// One piece of an assembled window, annotated with its token cost
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Instructions {
        text: String,
        tokens: usize,
    },
    Evidence {
        chunk_id: String,
        document_id: String,
        chunk_index: usize,
        score: f32,
        text: String,
        tokens: usize,
    },
    History {
        sequence: i64,
        role: MessageRole,
        text: String,
        tokens: usize,
    },
    NewMessage {
        text: String,
        tokens: usize,
    },
}

impl Segment {
    pub fn tokens(&self) -> usize {
        match self {
            Segment::Instructions { tokens, .. }
            | Segment::Evidence { tokens, .. }
            | Segment::History { tokens, .. }
            | Segment::NewMessage { tokens, .. } => *tokens,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Segment::Instructions { text, .. }
            | Segment::Evidence { text, .. }
            | Segment::History { text, .. }
            | Segment::NewMessage { text, .. } => text,
        }
    }

    pub fn is_evidence(&self) -> bool {
        matches!(self, Segment::Evidence { .. })
    }

    pub fn is_history(&self) -> bool {
        matches!(self, Segment::History { .. })
    }
}

/// A bounded prompt context. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ContextWindow {
    pub segments: Vec<Segment>,
    pub token_budget: usize,
    /// Retrieved chunks left out for lack of budget
    pub omitted_chunks: usize,
    /// History messages left out for lack of budget
    pub omitted_messages: usize,
}

impl ContextWindow {
    /// Sum of all segment costs
    pub fn total_tokens(&self) -> usize {
        self.segments.iter().map(Segment::tokens).sum()
    }

    pub fn evidence(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_evidence())
    }

    pub fn history(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_history())
    }

    pub fn instructions(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Instructions { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn new_message(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::NewMessage { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Builds context windows under a token budget
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    settings: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(settings: ContextConfig) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ContextConfig {
        &self.settings
    }

    /// Assemble a window from chronological `history`, relevance-ordered
    /// `retrieved` chunks and the incoming message.
    ///
    /// Fails with [`Error::BudgetTooSmall`] when the reserved allowances alone
    /// exceed `token_budget`, and with [`Error::MessageTooLong`] when the new
    /// message does not fit its allowance. No partial window is returned.
    pub fn build(
        &self,
        history: &[Message],
        retrieved: &[RetrievedChunk],
        new_message: &str,
        token_budget: usize,
    ) -> Result<ContextWindow> {
        let reserved = self.settings.reserved_tokens();
        if reserved > token_budget {
            return Err(Error::BudgetTooSmall {
                budget: token_budget,
                reserved,
            });
        }

        let instruction_tokens = count_tokens(&self.settings.system_prompt);
        if instruction_tokens > self.settings.reserved_instruction_tokens {
            return Err(Error::Config(format!(
                "system prompt is {} tokens but context.reserved_instruction_tokens is {}",
                instruction_tokens, self.settings.reserved_instruction_tokens
            )));
        }

        let message_tokens = count_tokens(new_message);
        if message_tokens == 0 {
            return Err(Error::InvalidInput("message is empty".to_string()));
        }
        if message_tokens > self.settings.reserved_new_message_tokens {
            return Err(Error::MessageTooLong {
                tokens: message_tokens,
                allowance: self.settings.reserved_new_message_tokens,
            });
        }

        let mut remaining = token_budget - reserved;

        let (mut evidence, omitted_chunks) = select_evidence(retrieved, &mut remaining);
        if self.settings.evidence_order == EvidenceOrder::Document {
            evidence.sort_by(|a, b| {
                a.chunk
                    .document_id
                    .cmp(&b.chunk.document_id)
                    .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
            });
        }

        let (included, omitted_messages) = self.select_history(history, &mut remaining);

        let mut segments = Vec::with_capacity(2 + evidence.len() + included.len());
        segments.push(Segment::Instructions {
            text: self.settings.system_prompt.clone(),
            tokens: instruction_tokens,
        });
        segments.extend(evidence.into_iter().map(|chunk| Segment::Evidence {
            chunk_id: chunk.chunk.id.clone(),
            document_id: chunk.chunk.document_id.clone(),
            chunk_index: chunk.chunk.index(),
            score: chunk.score,
            text: chunk.chunk.text.clone(),
            tokens: chunk.tokens(),
        }));
        for message in included {
            segments.push(Segment::History {
                sequence: message.sequence,
                role: message.get_role()?,
                text: message.content.clone(),
                tokens: message.tokens(),
            });
        }
        segments.push(Segment::NewMessage {
            text: new_message.to_string(),
            tokens: message_tokens,
        });

        let window = ContextWindow {
            segments,
            token_budget,
            omitted_chunks,
            omitted_messages,
        };

        info!(
            "Assembled context: {} evidence, {} history, {}/{} tokens ({} chunks and {} messages omitted)",
            window.evidence().count(),
            window.history().count(),
            window.total_tokens(),
            token_budget,
            omitted_chunks,
            omitted_messages
        );

        Ok(window)
    }

    /// Walk history newest first, returning the included messages in
    /// chronological order and the number left out.
    fn select_history<'a>(
        &self,
        history: &'a [Message],
        remaining: &mut usize,
    ) -> (Vec<&'a Message>, usize) {
        let max_skips = match self.settings.window_mode {
            WindowMode::Strict => 0,
            WindowMode::BestEffort => self.settings.best_effort_max_skips,
        };

        let mut ordered: Vec<&Message> = history.iter().collect();
        ordered.sort_by_key(|m| m.sequence);

        let mut included = Vec::new();
        let mut skips = 0;

        for message in ordered.iter().rev() {
            let cost = message.tokens();
            if cost <= *remaining {
                *remaining -= cost;
                included.push(*message);
                continue;
            }

            if skips >= max_skips {
                debug!(
                    "History window closed at message #{} ({} tokens, {} left)",
                    message.sequence, cost, remaining
                );
                break;
            }
            skips += 1;
            debug!(
                "Skipping message #{} ({} tokens, {} left)",
                message.sequence, cost, remaining
            );
        }

        included.reverse();
        let omitted = history.len() - included.len();
        (included, omitted)
    }
}

/// Take chunks in descending relevance until the next one does not fit
fn select_evidence<'a>(
    retrieved: &'a [RetrievedChunk],
    remaining: &mut usize,
) -> (Vec<&'a RetrievedChunk>, usize) {
    let mut ranked: Vec<&RetrievedChunk> = retrieved.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });

    let mut included = Vec::new();
    for chunk in ranked {
        let cost = chunk.tokens();
        if cost > *remaining {
            debug!(
                "Evidence closed at chunk {} ({} tokens, {} left)",
                chunk.chunk.id, cost, remaining
            );
            break;
        }
        *remaining -= cost;
        included.push(chunk);
    }

    let omitted = retrieved.len() - included.len();
    (included, omitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Chunk;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn settings(budget_reserved: (usize, usize), mode: WindowMode) -> ContextConfig {
        ContextConfig {
            reserved_instruction_tokens: budget_reserved.0,
            reserved_new_message_tokens: budget_reserved.1,
            window_mode: mode,
            system_prompt: "You are a helpful assistant.".to_string(),
            ..ContextConfig::default()
        }
    }

    fn chunk(doc: &str, index: i64, tokens: usize, score: f32) -> RetrievedChunk {
        let text = words(tokens);
        RetrievedChunk {
            chunk: Chunk {
                id: format!("{}-{}", doc, index),
                document_id: doc.to_string(),
                chunk_index: index,
                token_count: tokens as i64,
                byte_start: 0,
                byte_end: text.len() as i64,
                chunk_hash: String::new(),
                text,
                embedding: Vec::new(),
            },
            score,
        }
    }

    fn message(sequence: i64, tokens: usize) -> Message {
        Message {
            id: format!("m{}", sequence),
            conversation_id: "c".to_string(),
            sequence,
            role: if sequence % 2 == 1 { "user" } else { "assistant" }.to_string(),
            content: words(tokens),
            token_count: tokens as i64,
            model: None,
            created_at: String::new(),
        }
    }

    fn history(count: i64, tokens: usize) -> Vec<Message> {
        (1..=count).map(|s| message(s, tokens)).collect()
    }

    fn history_sequences(window: &ContextWindow) -> Vec<i64> {
        window
            .history()
            .map(|s| match s {
                Segment::History { sequence, .. } => *sequence,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_evidence_fills_budget_and_leaves_no_room_for_history() {
        let manager = ContextWindowManager::new(settings((100, 100), WindowMode::Strict));
        let retrieved: Vec<_> = (0..5).map(|i| chunk("doc", i, 150, 0.9 - i as f32 * 0.1)).collect();
        let window = manager
            .build(&history(4, 60), &retrieved, "what does it say", 1000)
            .unwrap();

        assert_eq!(window.evidence().count(), 5);
        assert_eq!(window.history().count(), 0);
        assert_eq!(window.omitted_chunks, 0);
        assert_eq!(window.omitted_messages, 4);
        assert!(window.total_tokens() <= 1000);

        assert!(matches!(window.segments.first(), Some(Segment::Instructions { .. })));
        assert!(matches!(window.segments.last(), Some(Segment::NewMessage { .. })));
        assert_eq!(window.segments.len(), 7);
    }

    #[test]
    fn test_reservations_over_budget_fail() {
        let manager = ContextWindowManager::new(settings((600, 600), WindowMode::Strict));
        let err = manager.build(&[], &[], "hello", 1000).unwrap_err();
        assert!(matches!(
            err,
            Error::BudgetTooSmall {
                budget: 1000,
                reserved: 1200
            }
        ));
    }

    #[test]
    fn test_reservations_equal_to_budget_leave_bare_window() {
        let manager = ContextWindowManager::new(settings((100, 100), WindowMode::Strict));
        let window = manager
            .build(&history(3, 5), &[chunk("doc", 0, 5, 0.9)], "hello", 200)
            .unwrap();
        assert_eq!(window.segments.len(), 2);
        assert_eq!(window.omitted_chunks, 1);
        assert_eq!(window.omitted_messages, 3);
    }

    #[test]
    fn test_new_message_over_allowance_is_rejected() {
        let manager = ContextWindowManager::new(settings((50, 10), WindowMode::Strict));
        let err = manager.build(&[], &[], &words(11), 1000).unwrap_err();
        assert!(matches!(
            err,
            Error::MessageTooLong {
                tokens: 11,
                allowance: 10
            }
        ));

        let err = manager.build(&[], &[], "   ", 1000).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_instructions_over_allowance_are_a_config_error() {
        let manager = ContextWindowManager::new(settings((2, 10), WindowMode::Strict));
        let err = manager.build(&[], &[], "hi", 1000).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_strict_window_takes_floor_of_budget_over_size() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        for (budget, size) in [(100usize, 30usize), (90, 30), (89, 30), (0, 10), (1000, 7)] {
            let window = manager
                .build(&history(20, size), &[], "next question", budget + 100)
                .unwrap();
            let expected = (budget / size).min(20);
            let sequences = history_sequences(&window);

            assert_eq!(sequences.len(), expected, "budget {} size {}", budget, size);
            let newest: Vec<i64> = (21 - expected as i64..=20).collect();
            assert_eq!(sequences, newest);
        }
    }

    #[test]
    fn test_strict_stops_at_first_miss() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        let mut messages = history(4, 10);
        messages[2] = message(3, 500);

        let window = manager.build(&messages, &[], "and then", 200).unwrap();
        assert_eq!(history_sequences(&window), vec![4]);
    }

    #[test]
    fn test_best_effort_skips_bounded_misses() {
        let mut config = settings((50, 50), WindowMode::BestEffort);
        config.best_effort_max_skips = 1;
        let manager = ContextWindowManager::new(config);

        let mut messages = history(6, 10);
        messages[4] = message(5, 500);
        messages[2] = message(3, 500);

        // One skip allowed: #5 is skipped, #3 closes the window
        let window = manager.build(&messages, &[], "and then", 200).unwrap();
        assert_eq!(history_sequences(&window), vec![4, 6]);
        assert_eq!(window.omitted_messages, 4);

        let mut config = settings((50, 50), WindowMode::BestEffort);
        config.best_effort_max_skips = 2;
        let window = ContextWindowManager::new(config)
            .build(&messages, &[], "and then", 200)
            .unwrap();
        assert_eq!(history_sequences(&window), vec![1, 2, 4, 6]);
    }

    #[test]
    fn test_oversized_chunk_is_never_truncated() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        let retrieved = vec![
            chunk("doc", 0, 40, 0.9),
            chunk("doc", 1, 80, 0.8),
            chunk("doc", 2, 10, 0.7),
        ];
        let window = manager.build(&[], &retrieved, "question", 200).unwrap();

        let included: Vec<usize> = window.evidence().map(Segment::tokens).collect();
        assert_eq!(included, vec![40]);
        assert_eq!(window.omitted_chunks, 2);
        for segment in window.evidence() {
            assert_eq!(crate::tokens::count_tokens(segment.text()), segment.tokens());
        }
    }

    #[test]
    fn test_no_evidence_falls_back_to_history() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        let window = manager.build(&history(3, 10), &[], "follow up", 500).unwrap();
        assert_eq!(window.evidence().count(), 0);
        assert_eq!(history_sequences(&window), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_history_is_evidence_and_message() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        let window = manager
            .build(&[], &[chunk("doc", 0, 10, 0.5)], "question", 500)
            .unwrap();
        assert_eq!(window.segments.len(), 3);
        assert_eq!(window.new_message(), Some("question"));
    }

    #[test]
    fn test_evidence_ordering_modes() {
        let retrieved = vec![
            chunk("b", 0, 5, 0.6),
            chunk("a", 3, 5, 0.9),
            chunk("a", 1, 5, 0.7),
        ];

        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::Strict));
        let window = manager.build(&[], &retrieved, "q", 500).unwrap();
        let ids: Vec<&str> = window
            .evidence()
            .map(|s| match s {
                Segment::Evidence { chunk_id, .. } => chunk_id.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["a-3", "a-1", "b-0"]);

        let mut config = settings((50, 50), WindowMode::Strict);
        config.evidence_order = EvidenceOrder::Document;
        let window = ContextWindowManager::new(config)
            .build(&[], &retrieved, "q", 500)
            .unwrap();
        let ids: Vec<&str> = window
            .evidence()
            .map(|s| match s {
                Segment::Evidence { chunk_id, .. } => chunk_id.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["a-1", "a-3", "b-0"]);
    }

    #[test]
    fn test_accounting_is_consistent() {
        let manager = ContextWindowManager::new(settings((50, 50), WindowMode::BestEffort));
        let retrieved: Vec<_> = (0..6).map(|i| chunk("doc", i, 7 + i as usize * 3, 0.5)).collect();
        let messages: Vec<Message> = (1..=15).map(|s| message(s, (s as usize * 7) % 23)).collect();

        for budget in [100usize, 150, 220, 400] {
            let window = manager.build(&messages, &retrieved, "why", budget).unwrap();
            let total = window.total_tokens();
            assert!(total <= budget);

            for i in 0..window.segments.len() {
                let mut reduced = window.clone();
                reduced.segments.remove(i);
                assert!(reduced.total_tokens() <= total);
            }
        }
    }
}
