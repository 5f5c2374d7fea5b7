//! Sliding-window text chunker with overlap.
//!
//! Splits knowledge-base documents into [`Chunk`]s of at most
//! `chunk_size` characters, where every chunk after the first repeats the
//! last `chunk_overlap` characters of its predecessor. Sizes and offsets
//! are measured in characters, not bytes, so multi-byte text never splits
//! inside a code point.
//!
//! # Algorithm
//!
//! 1. Open a window of `chunk_size` characters at the current start.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise look for a natural cut in the back half of the window,
//!    preferring (in order) a paragraph break, a line break, a sentence
//!    end, then a space. Fall back to a hard cut at the window edge.
//! 4. Emit the chunk and move the start to `cut - chunk_overlap`.
//!
//! Chunk IDs are `"{document}#{position}"` and each chunk carries a
//! SHA-256 of its text, so re-running the chunker on identical input
//! yields identical chunks.
//!
//! # Example
//!
//! ```rust
//! use support_harness_core::chunk::{chunk_document, ChunkingParams};
//!
//! let params = ChunkingParams { chunk_size: 512, chunk_overlap: 64 };
//! let chunks = chunk_document("faq", "How do refunds work?", &params).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "faq#0");
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Chunk, SourceDocument};

/// Cut-point separators, strongest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", " "];

/// Size and overlap budget for the chunker, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 77,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// The document has no non-whitespace content. Soft: callers skip it.
    #[error("document '{0}' is empty")]
    EmptyDocument(String),
}

/// Chunk every document, skipping empty ones with a warning.
///
/// Output order is document order, then position within the document.
pub fn build_chunks(documents: &[SourceDocument], params: &ChunkingParams) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for doc in documents {
        match chunk_document(&doc.id, &doc.text, params) {
            Ok(doc_chunks) => {
                debug!(document = %doc.id, chunks = doc_chunks.len(), "chunked document");
                chunks.extend(doc_chunks);
            }
            Err(e) => warn!("skipping document: {}", e),
        }
    }
    chunks
}

/// Split a single document into overlapping chunks.
///
/// # Guarantees
///
/// - A non-empty document always yields at least one chunk.
/// - No chunk exceeds `chunk_size` characters.
/// - Consecutive chunks share exactly `chunk_overlap` characters whenever
///   the cut left room for it.
/// - Positions are contiguous: `0, 1, 2, …, N-1`.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    params: &ChunkingParams,
) -> Result<Vec<Chunk>, ChunkError> {
    if text.trim().is_empty() {
        return Err(ChunkError::EmptyDocument(document_id.to_string()));
    }

    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size - 1);

    // Byte offset of every character, so char positions map back to slices.
    let offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total = offsets.len();
    let byte_at = |c: usize| if c >= total { text.len() } else { offsets[c] };

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let window_end = (start + size).min(total);
        let end = if window_end == total {
            total
        } else {
            find_cut(text, &offsets, start, window_end, size)
        };

        let piece = &text[byte_at(start)..byte_at(end)];
        if !piece.trim().is_empty() {
            chunks.push(make_chunk(document_id, chunks.len(), piece, start, end));
        }

        if end >= total {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Find the character index to cut a window at, preferring separators
/// in the back half of `[start, window_end)`.
fn find_cut(text: &str, offsets: &[usize], start: usize, window_end: usize, size: usize) -> usize {
    let lo_char = start + size / 2;
    let lo = offsets[lo_char.min(window_end - 1)];
    let hi = offsets[window_end];
    let window = &text[lo..hi];

    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            let cut_byte = lo + pos + sep.len();
            let cut = offsets.partition_point(|&b| b < cut_byte);
            if cut > start && cut <= window_end {
                return cut;
            }
        }
    }

    window_end
}

fn make_chunk(document_id: &str, position: usize, text: &str, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("{}#{}", document_id, position),
        text: text.to_string(),
        source_document: document_id.to_string(),
        position,
        char_start: start,
        char_end: end,
        hash,
    }
}
