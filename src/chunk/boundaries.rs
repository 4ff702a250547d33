//! Break point detection for chunking

use crate::tokens::TokenSpan;
use unicode_segmentation::UnicodeSegmentation;

/// Priority levels for break points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPriority {
    /// Hard cut between two tokens (lowest)
    Token = 1,
    /// Sentence boundary
    Sentence = 2,
    /// Paragraph boundary (highest)
    Paragraph = 3,
}

/// A run of tokens `[start, end)` that should stay in one chunk.
///
/// `priority` describes the break that follows the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub priority: BreakPriority,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Classify the natural break (if any) after each token.
///
/// A gap holding two or more newlines is a paragraph break. Otherwise a
/// Unicode sentence boundary inside the gap is a sentence break. The last
/// token always ends a paragraph.
pub fn find_breaks(text: &str, spans: &[TokenSpan]) -> Vec<Option<BreakPriority>> {
    let sentence_starts: Vec<usize> = text
        .split_sentence_bound_indices()
        .map(|(idx, _)| idx)
        .skip(1)
        .collect();

    let mut cursor = 0;
    let mut breaks = Vec::with_capacity(spans.len());

    for (i, span) in spans.iter().enumerate() {
        let Some(next) = spans.get(i + 1) else {
            breaks.push(Some(BreakPriority::Paragraph));
            continue;
        };

        if text[span.end..next.start].matches('\n').count() >= 2 {
            breaks.push(Some(BreakPriority::Paragraph));
            continue;
        }

        while cursor < sentence_starts.len() && sentence_starts[cursor] < span.end {
            cursor += 1;
        }

        let sentence_break =
            cursor < sentence_starts.len() && sentence_starts[cursor] <= next.start;
        breaks.push(sentence_break.then_some(BreakPriority::Sentence));
    }

    breaks
}

/// Group tokens into segments at natural breaks, hard-cutting any segment
/// longer than `max_len` tokens.
pub fn split_segments(breaks: &[Option<BreakPriority>], max_len: usize) -> Vec<Segment> {
    let max_len = max_len.max(1);
    let mut segments = Vec::new();
    let mut start = 0;

    for (i, brk) in breaks.iter().enumerate() {
        let Some(priority) = brk else {
            continue;
        };
        let end = i + 1;

        let mut piece_start = start;
        while end - piece_start > max_len {
            segments.push(Segment {
                start: piece_start,
                end: piece_start + max_len,
                priority: BreakPriority::Token,
            });
            piece_start += max_len;
        }
        segments.push(Segment {
            start: piece_start,
            end,
            priority: *priority,
        });
        start = end;
    }

    segments
}
