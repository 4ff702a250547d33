//! Text chunking
//!
//! This module splits extracted document text into overlapping chunks:
//! - Chunks never exceed `max_tokens`
//! - Breaks prefer paragraph, then sentence boundaries; over-long sentences are hard cut
//! - Consecutive chunks share up to `overlap_tokens` tokens
//! - Output is fully deterministic, so re-ingesting the same text yields the same chunks

mod boundaries;

pub use boundaries::*;

use crate::config::ChunkConfig;
use crate::error::{Error, Result};
use crate::tokens::{token_spans, TokenSpan};
use blake3::Hasher;
use tracing::debug;

/// Minimum fill (as a fraction of `max_tokens`) a chunk must reach before an
/// earlier paragraph break is preferred over packing it full
const PARAGRAPH_FILL_NUMERATOR: usize = 4;
const PARAGRAPH_FILL_DENOMINATOR: usize = 5;

/// A text chunk with its position in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Chunk index (0-based)
    pub index: usize,

    /// The chunk text, sliced verbatim from the source
    pub text: String,

    /// Number of tokens in `text`
    pub token_count: usize,

    /// Byte offset of the first token in the source text
    pub byte_start: usize,

    /// Byte offset just past the last token in the source text
    pub byte_end: usize,

    /// Blake3 hash of the chunk text
    pub hash: String,
}

/// Splits text into bounded, overlapping chunks
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if max_tokens == 0 {
            return Err(Error::Config("max_tokens must be positive".to_string()));
        }
        if overlap_tokens >= max_tokens {
            return Err(Error::Config(format!(
                "overlap_tokens ({}) must be < max_tokens ({})",
                overlap_tokens, max_tokens
            )));
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn from_config(config: &ChunkConfig) -> Result<Self> {
        Self::new(config.max_tokens, config.overlap_tokens)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Chunk `text`, failing with [`Error::EmptyDocument`] if it holds no tokens
    pub fn chunk(&self, text: &str) -> Result<Vec<TextChunk>> {
        let spans = token_spans(text);
        if spans.is_empty() {
            return Err(Error::EmptyDocument);
        }

        // Segments are capped at the stride so the carried overlap plus the
        // next segment always fits in one chunk.
        let stride = self.max_tokens - self.overlap_tokens;
        let breaks = find_breaks(text, &spans);
        let segments = split_segments(&breaks, stride);

        let mut chunks = Vec::new();
        let mut next_seg = 0;
        let mut start_tok = 0;

        while next_seg < segments.len() {
            let mut end_seg = next_seg + 1;
            while end_seg < segments.len()
                && segments[end_seg].end - start_tok <= self.max_tokens
            {
                end_seg += 1;
            }

            if end_seg < segments.len() {
                end_seg = self.prefer_paragraph_end(&segments, next_seg, end_seg, start_tok);
            }

            let end_tok = segments[end_seg - 1].end;
            chunks.push(build_chunk(text, &spans, start_tok, end_tok, chunks.len()));

            next_seg = end_seg;
            if next_seg < segments.len() {
                let overlap = self.overlap_tokens.min(end_tok - start_tok - 1);
                start_tok = end_tok - overlap;
            }
        }

        debug!(
            "Chunked {} tokens into {} chunks (max {}, overlap {})",
            spans.len(),
            chunks.len(),
            self.max_tokens,
            self.overlap_tokens
        );

        Ok(chunks)
    }

    /// Pull the chunk end back to a paragraph break when one exists late
    /// enough in the chunk. `end_seg` is exclusive.
    fn prefer_paragraph_end(
        &self,
        segments: &[Segment],
        first_seg: usize,
        end_seg: usize,
        start_tok: usize,
    ) -> usize {
        if segments[end_seg - 1].priority == BreakPriority::Paragraph {
            return end_seg;
        }

        let floor = self.max_tokens * PARAGRAPH_FILL_NUMERATOR / PARAGRAPH_FILL_DENOMINATOR;
        (first_seg + 1..end_seg)
            .rev()
            .find(|&k| {
                let seg = &segments[k - 1];
                seg.priority == BreakPriority::Paragraph && seg.end - start_tok >= floor
            })
            .unwrap_or(end_seg)
    }
}

fn build_chunk(
    text: &str,
    spans: &[TokenSpan],
    start_tok: usize,
    end_tok: usize,
    index: usize,
) -> TextChunk {
    let byte_start = spans[start_tok].start;
    let byte_end = spans[end_tok - 1].end;
    let chunk_text = &text[byte_start..byte_end];

    TextChunk {
        index,
        text: chunk_text.to_string(),
        token_count: end_tok - start_tok,
        byte_start,
        byte_end,
        hash: compute_text_hash(chunk_text),
    }
}

/// Chunk `text` with explicit parameters
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Result<Vec<TextChunk>> {
    Chunker::new(max_tokens, overlap_tokens)?.chunk(text)
}

/// Compute content hash for raw document bytes
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize().to_hex().to_string()
}

/// Compute hash for a text string
pub fn compute_text_hash(text: &str) -> String {
    compute_content_hash(text.as_bytes())
}
