//! Fixed-window text chunker with overlap.
//!
//! Splits each document into windows of at most `chunk_size` characters,
//! consecutive windows sharing `chunk_overlap` characters. A window that
//! would cut mid-text is pulled back to the nearest paragraph, line or word
//! boundary in its second half. Offsets are counted in characters, not bytes.
//!
//! Output is a pure function of the input: each chunk's ID is a UUIDv5 of
//! its source path, content hash and start offset.

use uuid::Uuid;

use crate::models::{ChunkMetadata, DocumentChunk, RawDocument};

/// A window of text and its character offset in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub start: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkingPipeline {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkingPipeline {
    /// `chunk_size` must be non-zero and larger than `chunk_overlap`; the
    /// config loader enforces both.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    /// Split every document, preserving document order.
    pub fn split(&self, documents: &[RawDocument]) -> Vec<DocumentChunk> {
        documents
            .iter()
            .flat_map(|doc| self.split_document(doc))
            .collect()
    }

    fn split_document(&self, doc: &RawDocument) -> Vec<DocumentChunk> {
        split_text(&doc.text, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, window)| DocumentChunk {
                id: chunk_id(&doc.metadata.file_path, &doc.metadata.file_hash, window.start),
                text: window.text,
                metadata: ChunkMetadata {
                    source: doc.metadata.clone(),
                    start_index: window.start,
                    chunk_index,
                },
            })
            .collect()
    }
}

/// Split text into overlapping windows. Empty or whitespace-only windows are dropped.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextWindow> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let chunk_size = chunk_size.max(1);
    let mut windows = Vec::new();
    let mut start = 0;

    while start < total {
        let hard_end = (start + chunk_size).min(total);
        let end = if hard_end < total {
            find_break_point(&chars, start, hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            windows.push(TextWindow { start, text: piece });
        }

        if end >= total {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    windows
}

/// Best cut position in `(start, hard_end]`, never earlier than halfway.
fn find_break_point(chars: &[char], start: usize, hard_end: usize) -> usize {
    let floor = start + (hard_end - start) / 2;

    // Paragraph break
    for i in (floor.max(start + 1)..hard_end).rev() {
        if chars[i] == '\n' && chars[i - 1] == '\n' {
            return i + 1;
        }
    }
    // Line break
    for i in (floor..hard_end).rev() {
        if chars[i] == '\n' {
            return i + 1;
        }
    }
    // Word break
    for i in (floor..hard_end).rev() {
        if chars[i].is_whitespace() {
            return i + 1;
        }
    }

    hard_end
}

fn chunk_id(file_path: &str, file_hash: &str, start: usize) -> String {
    let name = format!("{}#{}@{}", file_path, file_hash, start);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}
