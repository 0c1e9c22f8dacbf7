//! Text chunker (C6).
//!
//! Splits document text into ordered `(chunk_index, text)` pairs honoring a
//! configurable token budget and strategy. A token is approximated at a
//! fixed chars-per-token ratio, matching how the rest of the crate estimates
//! token counts without a real tokenizer in the loop.

use sha2::{Digest, Sha256};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Sentence,
    Semantic,
    Token,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Sentence => "SENTENCE",
            ChunkStrategy::Semantic => "SEMANTIC",
            ChunkStrategy::Token => "TOKEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENTENCE" => Some(ChunkStrategy::Sentence),
            "SEMANTIC" => Some(ChunkStrategy::Semantic),
            "TOKEN" => Some(ChunkStrategy::Token),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedText {
    pub chunk_index: i64,
    pub text: String,
}

/// Splits `text` into ordered, non-empty chunks. Returns an empty vec for
/// blank input — callers treat that as `EmptyDocument`.
pub fn chunk_text(
    text: &str,
    target_tokens: usize,
    overlap_tokens: usize,
    strategy: ChunkStrategy,
) -> Vec<ChunkedText> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = (target_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;
    let prefer_boundary = !matches!(strategy, ChunkStrategy::Token);

    let units = split_units(text, strategy);
    let mut pieces: Vec<&str> = Vec::new();
    for unit in units {
        let trimmed = unit.trim();
        if trimmed.is_empty() {
            continue;
        }
        pieces.extend(decompose_oversized(trimmed, max_chars, prefer_boundary));
    }

    let mut bodies: Vec<String> = Vec::new();
    let mut buf = String::new();

    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let candidate_len = if buf.is_empty() {
            piece.len()
        } else {
            buf.len() + 1 + piece.len()
        };
        if candidate_len > max_chars && !buf.is_empty() {
            bodies.push(buf.trim().to_string());
            buf = tail_chars(&buf, overlap_chars);
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(piece);
    }
    if !buf.trim().is_empty() {
        bodies.push(buf.trim().to_string());
    }

    bodies
        .into_iter()
        .enumerate()
        .map(|(i, text)| ChunkedText {
            chunk_index: i as i64,
            text,
        })
        .collect()
}

/// Deterministic chunk identifier: stable across re-ingestion of the same
/// document text so unchanged chunks compare equal by id.
pub fn chunk_id(document_id: &str, chunk_index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_units(text: &str, strategy: ChunkStrategy) -> Vec<&str> {
    match strategy {
        ChunkStrategy::Token => vec![text],
        ChunkStrategy::Semantic => text.split("\n\n").collect(),
        ChunkStrategy::Sentence => split_sentences(text),
    }
}

/// Splits on `.`/`!`/`?` followed by whitespace or end of string, tolerating
/// a trailing quote or closing paren before the boundary.
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'.' || c == b'!' || c == b'?' {
            let mut j = i + 1;
            while j < bytes.len() && matches!(bytes[j], b'"' | b'\'' | b')') {
                j += 1;
            }
            if j >= bytes.len() || bytes[j].is_ascii_whitespace() {
                out.push(&text[start..j]);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Cuts `unit` into pieces no longer than `max_chars`. When `prefer_boundary`
/// is set, prefers the last newline or space within the budget over a raw cut.
fn decompose_oversized(unit: &str, max_chars: usize, prefer_boundary: bool) -> Vec<&str> {
    if unit.len() <= max_chars {
        return vec![unit];
    }
    let mut pieces = Vec::new();
    let mut remaining = unit;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }
        let split_at = if prefer_boundary {
            remaining[..max_chars]
                .rfind('\n')
                .or_else(|| remaining[..max_chars].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(max_chars)
        } else {
            max_chars
        };
        let split_at = split_at.max(1);
        pieces.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    pieces
}

fn tail_chars(s: &str, n: usize) -> String {
    if n == 0 || s.is_empty() {
        return String::new();
    }
    let char_count = s.chars().count();
    if char_count <= n {
        return s.to_string();
    }
    let skip = char_count - n;
    s.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 700, 0, ChunkStrategy::Semantic);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 700, 0, ChunkStrategy::Semantic).is_empty());
        assert!(chunk_text("   \n  ", 700, 0, ChunkStrategy::Sentence).is_empty());
    }

    #[test]
    fn semantic_keeps_paragraphs_together_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, 700, 0, ChunkStrategy::Semantic);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn indices_are_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, 10, 0, ChunkStrategy::Semantic);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert!(chunks.len() > 1);
    }

    #[test]
    fn overlap_carries_tail_into_next_chunk() {
        let text = (0..30)
            .map(|i| format!("Sentence number {} ends here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let no_overlap = chunk_text(&text, 15, 0, ChunkStrategy::Sentence);
        let with_overlap = chunk_text(&text, 15, 5, ChunkStrategy::Sentence);
        assert!(with_overlap.len() >= no_overlap.len());
        // The second chunk should start with a tail of the first chunk's text.
        if with_overlap.len() > 1 {
            let first_tail = tail_chars(&with_overlap[0].text, 5 * CHARS_PER_TOKEN);
            assert!(!first_tail.is_empty());
        }
    }

    #[test]
    fn token_strategy_ignores_boundaries() {
        let text = "a".repeat(100);
        let chunks = chunk_text(&text, 5, 0, ChunkStrategy::Token);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 5 * CHARS_PER_TOKEN);
        }
    }

    #[test]
    fn deterministic_chunk_ids() {
        let a = chunk_id("doc-1", 0);
        let b = chunk_id("doc-1", 0);
        let c = chunk_id("doc-1", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sentence_strategy_splits_on_punctuation() {
        let chunks = chunk_text(
            "One. Two! Three? Four.",
            1,
            0,
            ChunkStrategy::Sentence,
        );
        assert!(chunks.len() >= 2);
    }
}
