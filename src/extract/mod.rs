//! Text extraction from uploaded documents
//!
//! This module handles:
//! - Content type detection by MIME type and extension
//! - PDF text extraction (feature `pdf`)
//! - UTF-8 plain text and markdown
//! - Whitespace normalization and hyphenation repair
//!
//! Any failure to produce text surfaces as [`Error::DocumentUnreadable`];
//! text that is present but blank is [`Error::EmptyDocument`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Content types we can extract text from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Pdf,
    Markdown,
    PlainText,
    Unsupported,
}

impl ContentType {
    /// Detect content type from MIME type
    pub fn from_mime(mime: &str) -> Self {
        let mime_lower = mime.to_lowercase();
        if mime_lower.contains("application/pdf") {
            ContentType::Pdf
        } else if mime_lower.contains("text/markdown") || mime_lower.contains("text/x-markdown") {
            ContentType::Markdown
        } else if mime_lower.starts_with("text/") {
            ContentType::PlainText
        } else {
            ContentType::Unsupported
        }
    }

    /// Detect content type from a file path
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
            Some("pdf") => return ContentType::Pdf,
            Some("md") | Some("markdown") => return ContentType::Markdown,
            Some("txt") | Some("text") | Some("rst") => return ContentType::PlainText,
            _ => {}
        }

        mime_guess::from_path(path)
            .first()
            .map(|mime| Self::from_mime(mime.essence_str()))
            .unwrap_or(ContentType::Unsupported)
    }

    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentType::Pdf => "application/pdf",
            ContentType::Markdown => "text/markdown",
            ContentType::PlainText => "text/plain",
            ContentType::Unsupported => "application/octet-stream",
        }
    }
}

/// Turns document bytes into plain text
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String>;

    fn content_type(&self) -> ContentType;
}

/// UTF-8 text and markdown
#[derive(Debug, Clone, Copy)]
pub struct PlainTextExtractor {
    kind: ContentType,
}

impl PlainTextExtractor {
    pub fn new(kind: ContentType) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String> {
        if is_binary_content(bytes) {
            return Err(Error::DocumentUnreadable(
                "content looks binary".to_string(),
            ));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::DocumentUnreadable(format!("invalid UTF-8: {}", e)))?;
        finish(text)
    }

    fn content_type(&self) -> ContentType {
        self.kind
    }
}

/// PDF text via `pdf-extract`
#[cfg(feature = "pdf")]
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

#[cfg(feature = "pdf")]
#[async_trait]
impl TextExtractor for PdfExtractor {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String> {
        let bytes = bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| Error::DocumentUnreadable(format!("extraction task failed: {}", e)))?
            .map_err(|e| Error::DocumentUnreadable(format!("PDF extraction error: {}", e)))?;
        finish(&text)
    }

    fn content_type(&self) -> ContentType {
        ContentType::Pdf
    }
}

/// Pick an extractor for a file
pub fn extractor_for_path(path: &Path) -> Result<Arc<dyn TextExtractor>> {
    extractor_for(ContentType::from_path(path)).ok_or_else(|| {
        Error::DocumentUnreadable(format!("unsupported file type: {}", path.display()))
    })
}

/// Pick an extractor for a content type, if one is available in this build
pub fn extractor_for(kind: ContentType) -> Option<Arc<dyn TextExtractor>> {
    match kind {
        #[cfg(feature = "pdf")]
        ContentType::Pdf => Some(Arc::new(PdfExtractor)),
        #[cfg(not(feature = "pdf"))]
        ContentType::Pdf => None,
        ContentType::Markdown | ContentType::PlainText => {
            Some(Arc::new(PlainTextExtractor::new(kind)))
        }
        ContentType::Unsupported => None,
    }
}

fn finish(raw: &str) -> Result<String> {
    let text = normalize_text(raw);
    if text.is_empty() {
        return Err(Error::EmptyDocument);
    }
    Ok(text)
}

/// Check if content appears to be binary
pub fn is_binary_content(data: &[u8]) -> bool {
    let check_len = std::cmp::min(data.len(), 8192);
    data[..check_len].contains(&0)
}

fn hyphen_break() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\p{L})-[ \t]*\r?\n[ \t]*(\p{Ll})").ok())
        .as_ref()
}

/// Join words hyphenated across a line break, then normalize whitespace
pub fn normalize_text(text: &str) -> String {
    let joined = match hyphen_break() {
        Some(re) => re.replace_all(text, "$1$2").into_owned(),
        None => text.to_string(),
    };
    normalize_whitespace(&joined)
}

/// Collapse whitespace runs: two or more newlines become a paragraph break,
/// one newline stays a line break, anything else becomes a single space.
pub fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut pending_space = false;
    let mut newline_count = 0;

    for c in text.chars() {
        if c.is_whitespace() {
            if c == '\n' {
                newline_count += 1;
            }
            pending_space = true;
            continue;
        }

        if pending_space && !result.is_empty() {
            match newline_count {
                0 => result.push(' '),
                1 => result.push('\n'),
                _ => result.push_str("\n\n"),
            }
        }
        newline_count = 0;
        pending_space = false;
        result.push(c);
    }

    result
}
