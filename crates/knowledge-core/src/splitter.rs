//! Text splitters turning loaded documents into chunks.
//!
//! Two strategies, looked up by name with [`get_splitter`]:
//!
//! - `paragraph`: [`ParagraphSplitter`], paragraph-boundary packing with an
//!   optional overlap between consecutive chunks;
//! - `markdown`: [`MarkdownSplitter`], one section per heading, oversized
//!   sections packed like `paragraph`.
//!
//! # Paragraph algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs into a buffer until adding the next paragraph
//!    would exceed `max_chars`.
//! 4. When exceeded, flush the buffer as a chunk and start a new one.
//! 5. If a single paragraph exceeds `max_chars`, perform a hard split at
//!    the nearest newline or space boundary.
//! 6. With `overlap_tokens > 0`, each chunk after the first is prefixed
//!    with the tail of its predecessor, cut at a word boundary.
//!
//! Blank input yields no chunks. Chunks inherit the parent's metadata.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::Document;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

pub const DEFAULT_MAX_TOKENS: usize = 700;

pub trait Splitter: Send + Sync {
    fn name(&self) -> &str;

    fn split(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>>;
}

/// Build a splitter by name from its JSON options.
pub fn get_splitter(name: &str, options: &serde_json::Map<String, Value>) -> Result<Box<dyn Splitter>> {
    let opts: SplitterOptions = serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| Error::Config(format!("invalid options for splitter {:?}: {}", name, e)))?;
    if opts.max_tokens == 0 || opts.overlap_tokens >= opts.max_tokens {
        return Err(Error::Config(format!(
            "splitter {:?}: need max_tokens > 0 and overlap_tokens < max_tokens (got {} / {})",
            name, opts.overlap_tokens, opts.max_tokens
        )));
    }
    match name {
        ParagraphSplitter::NAME => Ok(Box::new(ParagraphSplitter::new(
            opts.max_tokens,
            opts.overlap_tokens,
        ))),
        MarkdownSplitter::NAME => Ok(Box::new(MarkdownSplitter::new(
            opts.max_tokens,
            opts.overlap_tokens,
        ))),
        other => Err(Error::Config(format!("unknown splitter {:?}", other))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SplitterOptions {
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default)]
    overlap_tokens: usize,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

/// Paragraph-boundary splitter.
#[derive(Debug, Clone)]
pub struct ParagraphSplitter {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl ParagraphSplitter {
    pub const NAME: &'static str = "paragraph";

    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            overlap_tokens,
        }
    }

    /// Split raw text into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let pieces = pack_paragraphs(text, self.max_tokens * CHARS_PER_TOKEN);
        with_overlap(pieces, self.overlap_tokens * CHARS_PER_TOKEN)
    }
}

impl Default for ParagraphSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS, 0)
    }
}

impl Splitter for ParagraphSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn split(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        Ok(docs
            .into_iter()
            .flat_map(|parent| {
                self.split_text(&parent.content)
                    .into_iter()
                    .map(move |text| Document {
                        metadata: parent.metadata.clone(),
                        ..Document::new(text)
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}

/// Heading-aware markdown splitter.
///
/// Headings inside fenced code blocks are not section boundaries. Each
/// chunk records its nearest heading under the `heading` metadata key.
#[derive(Debug, Clone)]
pub struct MarkdownSplitter {
    inner: ParagraphSplitter,
}

impl MarkdownSplitter {
    pub const NAME: &'static str = "markdown";

    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            inner: ParagraphSplitter::new(max_tokens, overlap_tokens),
        }
    }
}

impl Default for MarkdownSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS, 0)
    }
}

/// Split markdown into `(heading, section)` pairs. The section text keeps
/// its heading line.
fn markdown_sections(text: &str) -> Vec<(Option<String>, String)> {
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    let mut heading: Option<String> = None;
    let mut buf = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let is_heading = !in_fence
            && trimmed.starts_with('#')
            && trimmed
                .trim_start_matches('#')
                .starts_with(|c: char| c == ' ' || c == '\t');
        if is_heading {
            if !buf.trim().is_empty() {
                sections.push((heading.take(), std::mem::take(&mut buf)));
            }
            buf.clear();
            heading = Some(trimmed.trim_start_matches('#').trim().to_string());
        }
        buf.push_str(line);
        buf.push('\n');
    }
    if !buf.trim().is_empty() {
        sections.push((heading, buf));
    }
    sections
}

impl Splitter for MarkdownSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn split(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        let mut out = Vec::new();
        for parent in docs {
            for (heading, section) in markdown_sections(&parent.content) {
                for text in self.inner.split_text(&section) {
                    let mut chunk = Document {
                        metadata: parent.metadata.clone(),
                        ..Document::new(text)
                    };
                    if let Some(h) = &heading {
                        chunk.set_metadata("heading", h.as_str());
                    }
                    out.push(chunk);
                }
            }
        }
        Ok(out)
    }
}

fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                chunks.push(std::mem::take(&mut current_buf));
            }
            hard_split(trimmed, max_chars, &mut chunks);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }
    chunks
}

/// Cut an oversized paragraph at newline or space boundaries.
fn hard_split(text: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let split_at = if split_at == 0 {
            next_char_boundary(remaining)
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

fn with_overlap(pieces: Vec<String>, overlap_chars: usize) -> Vec<String> {
    if overlap_chars == 0 || pieces.len() < 2 {
        return pieces;
    }
    let mut out = Vec::with_capacity(pieces.len());
    let mut prev: Option<&str> = None;
    for piece in &pieces {
        match prev {
            Some(p) => {
                let tail = tail_at_word_boundary(p, overlap_chars);
                if tail.is_empty() {
                    out.push(piece.clone());
                } else {
                    out.push(format!("{} {}", tail, piece));
                }
            }
            None => out.push(piece.clone()),
        }
        prev = Some(piece);
    }
    out
}

/// The last at most `max_chars` bytes of `s`, starting on a word.
fn tail_at_word_boundary(s: &str, max_chars: usize) -> &str {
    if s.len() <= max_chars {
        return s.trim();
    }
    let mut start = s.len() - max_chars;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(ws) => tail[ws..].trim(),
        None => tail.trim(),
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}
