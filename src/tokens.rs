//! Token estimation
//!
//! A token is a maximal run of non-whitespace characters. The chunker and the
//! context window manager both measure in this unit, so a chunk that was cut
//! to `max_tokens` costs exactly its `token_count` when placed in a window.

/// Byte span of a single token within its source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

/// Count the tokens in `text`
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Locate every token in `text` as byte offsets (always on char boundaries)
pub fn token_spans(text: &str) -> Vec<TokenSpan> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(TokenSpan { start: s, end: idx });
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }

    if let Some(s) = start {
        spans.push(TokenSpan {
            start: s,
            end: text.len(),
        });
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   \n\t "), 0);
        assert_eq!(count_tokens("one two  three\nfour"), 4);
    }

    #[test]
    fn test_spans_match_count() {
        let text = "  Grüße, Welt!\n\nZweiter Absatz.  ";
        let spans = token_spans(text);
        assert_eq!(spans.len(), count_tokens(text));
        assert_eq!(&text[spans[0].start..spans[0].end], "Grüße,");
        assert_eq!(&text[spans[3].start..spans[3].end], "Absatz.");
    }

    #[test]
    fn test_span_at_end_of_text() {
        let spans = token_spans("tail");
        assert_eq!(spans, vec![TokenSpan { start: 0, end: 4 }]);
    }
}
