//! Token-bounded text chunking.
//!
//! Two strategies:
//! - **Semantic**: split on paragraph then sentence boundaries and
//!   accumulate sentences into a token-bounded buffer, flushing when the
//!   budget would be exceeded. An optional overlap carries trailing
//!   sentences into the next chunk.
//! - **Fixed**: tokenize the whole text and slide a fixed window with
//!   explicit overlap. Output is byte-identical across runs for identical
//!   inputs.
//!
//! Token counts are whitespace-token counts. That is an approximation of a
//! model tokenizer, applied consistently wherever a budget is enforced.
//!
//! A single sentence longer than `max_tokens` becomes its own chunk with
//! `oversized = true` — it is never truncated.

use crate::models::ChunkDraft;

/// Chunking strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Semantic,
    Fixed,
}

impl ChunkStrategy {
    pub fn from_name(name: &str) -> Option<ChunkStrategy> {
        match name {
            "semantic" => Some(ChunkStrategy::Semantic),
            "fixed" => Some(ChunkStrategy::Fixed),
            _ => None,
        }
    }
}

/// Count tokens in a text (whitespace tokens).
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split text into token-bounded chunks with contiguous ordinals from 0.
///
/// `overlap` must be smaller than `max_tokens` (validated at config load).
pub fn chunk_text(
    text: &str,
    strategy: ChunkStrategy,
    max_tokens: usize,
    overlap: usize,
) -> Vec<ChunkDraft> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match strategy {
        ChunkStrategy::Semantic => semantic_chunks(text, max_tokens, overlap),
        ChunkStrategy::Fixed => fixed_chunks(text, max_tokens, overlap),
    }
}

// ============ Semantic strategy ============

fn semantic_chunks(text: &str, max_tokens: usize, overlap: usize) -> Vec<ChunkDraft> {
    let mut chunks: Vec<ChunkDraft> = Vec::new();
    let mut buf: Vec<String> = Vec::new();
    let mut buf_tokens = 0usize;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        for sentence in split_sentences(trimmed) {
            let tokens = count_tokens(&sentence);

            if tokens > max_tokens {
                // Retained whole and flagged, never truncated.
                flush(&mut chunks, &mut buf, &mut buf_tokens);
                push_chunk(&mut chunks, sentence, tokens, true);
                continue;
            }

            if buf_tokens + tokens > max_tokens && !buf.is_empty() {
                let carry = overlap_tail(&buf, overlap);
                flush(&mut chunks, &mut buf, &mut buf_tokens);
                let carry_tokens: usize = carry.iter().map(|s| count_tokens(s)).sum();
                if carry_tokens + tokens <= max_tokens {
                    buf = carry;
                    buf_tokens = carry_tokens;
                }
            }

            buf_tokens += tokens;
            buf.push(sentence);
        }
    }
    flush(&mut chunks, &mut buf, &mut buf_tokens);
    chunks
}

fn flush(chunks: &mut Vec<ChunkDraft>, buf: &mut Vec<String>, buf_tokens: &mut usize) {
    if buf.is_empty() {
        return;
    }
    let text = buf.join(" ");
    let tokens = *buf_tokens;
    buf.clear();
    *buf_tokens = 0;
    push_chunk(chunks, text, tokens, false);
}

fn push_chunk(chunks: &mut Vec<ChunkDraft>, text: String, token_count: usize, oversized: bool) {
    let ordinal = chunks.len();
    chunks.push(ChunkDraft {
        ordinal,
        text,
        token_count,
        oversized,
    });
}

/// Trailing sentences of the buffer whose combined token count fits in
/// `overlap`, in original order.
fn overlap_tail(buf: &[String], overlap: usize) -> Vec<String> {
    if overlap == 0 {
        return Vec::new();
    }
    let mut tail: Vec<String> = Vec::new();
    let mut tokens = 0usize;
    for sentence in buf.iter().rev() {
        let t = count_tokens(sentence);
        if tokens + t > overlap {
            break;
        }
        tokens += t;
        tail.push(sentence.clone());
    }
    tail.reverse();
    tail
}

/// Split a paragraph into sentences on `.`, `!`, `?` followed by
/// whitespace or end of text. The terminator stays with its sentence.
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = paragraph.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                None => true,
                Some(next) => next.is_whitespace(),
            };
            if at_boundary {
                let s = current.trim();
                if !s.is_empty() {
                    sentences.push(s.to_string());
                }
                current.clear();
            }
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        sentences.push(s.to_string());
    }
    sentences
}

// ============ Fixed strategy ============

fn fixed_chunks(text: &str, max_tokens: usize, overlap: usize) -> Vec<ChunkDraft> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let step = max_tokens.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + max_tokens).min(tokens.len());
        push_chunk(
            &mut chunks,
            tokens[start..end].join(" "),
            end - start,
            false,
        );
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    chunks
}
