//! Boundary-aware, overlapping text chunker.
//!
//! Splits extracted document text into [`TextChunk`]s of at most
//! `max_chunk_chars` characters. Every chunk after the first begins with the
//! trailing `overlap_chars` characters of its predecessor so that retrieval
//! keeps context across chunk boundaries.
//!
//! Lengths are counted in Unicode scalar values, never bytes, and chunk text
//! is never trimmed: dropping the first `overlap_chars` characters of every
//! chunk but the first and concatenating reconstructs the input exactly.
//!
//! # Algorithm
//!
//! 1. Start a window at `start`; the hard end is `start + max_chunk_chars`.
//! 2. If the rest of the text fits, emit it and stop.
//! 3. Otherwise look backwards from the hard end for the best boundary, in
//!    order: paragraph break (`\n\n`), sentence end (`.`, `!`, `?` followed by
//!    whitespace), line break, space. A boundary is only accepted if it keeps
//!    at least half of the non-overlap window in the chunk.
//! 4. With no acceptable boundary, cut hard at `max_chunk_chars`.
//! 5. The next window starts `overlap_chars` before the cut.
//!
//! # Example
//!
//! ```rust
//! use healthflow_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams::new(20, 5).unwrap();
//! let chunks = chunk_text("Short note.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! assert!(chunk_text("", &params).is_empty());
//! ```

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    max_chunk_chars: usize,
    overlap_chars: usize,
}

impl ChunkParams {
    /// Requires `0 <= overlap_chars < max_chunk_chars`.
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> CoreResult<Self> {
        if max_chunk_chars == 0 {
            return Err(CoreError::Validation(
                "max_chunk_chars must be > 0".to_string(),
            ));
        }
        if overlap_chars >= max_chunk_chars {
            return Err(CoreError::Validation(format!(
                "overlap_chars ({}) must be smaller than max_chunk_chars ({})",
                overlap_chars, max_chunk_chars
            )));
        }
        Ok(Self {
            max_chunk_chars,
            overlap_chars,
        })
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }
}

/// A chunk produced by [`chunk_text`], before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub char_count: usize,
    /// SHA-256 of `text` (lowercase hex).
    pub hash: String,
}

/// Boundary kinds, strongest first.
const BOUNDARY_LEVELS: [Boundary; 4] = [
    Boundary::Paragraph,
    Boundary::Sentence,
    Boundary::Line,
    Boundary::Word,
];

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Line,
    Word,
}

impl Boundary {
    /// Whether a cut right before `chars[end]` sits on this boundary.
    fn matches(&self, chars: &[char], end: usize) -> bool {
        let prev = chars[end - 1];
        match self {
            Boundary::Paragraph => end >= 2 && prev == '\n' && chars[end - 2] == '\n',
            Boundary::Sentence => {
                end >= 2 && prev.is_whitespace() && matches!(chars[end - 2], '.' | '!' | '?')
            }
            Boundary::Line => prev == '\n',
            Boundary::Word => prev == ' ',
        }
    }
}

/// Split `text` into ordered, overlapping chunks.
///
/// # Guarantees
///
/// - Empty input yields no chunks.
/// - Indices are contiguous: `0, 1, …, N-1`.
/// - No chunk is longer than `max_chunk_chars` characters.
/// - Chunk `i > 0` starts with the last `overlap_chars` characters of chunk
///   `i - 1`.
/// - Same input and parameters always give the same output.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let max = params.max_chunk_chars;
    let overlap = params.overlap_chars;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let hard_end = (start + max).min(total);
        let end = if hard_end == total {
            total
        } else {
            // Never cut inside the overlap region, or the next window would
            // not advance.
            let window = max - overlap;
            let min_end = start + overlap + (window / 2).max(1);
            find_boundary(&chars, min_end, hard_end).unwrap_or(hard_end)
        };

        let piece: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(chunks.len(), piece, end - start));

        if end == total {
            break;
        }
        start = end - overlap;
    }

    chunks
}

/// Best boundary cut in `[min_end, hard_end]`, strongest level first and the
/// latest position within a level.
fn find_boundary(chars: &[char], min_end: usize, hard_end: usize) -> Option<usize> {
    if min_end > hard_end {
        return None;
    }
    BOUNDARY_LEVELS.iter().find_map(|level| {
        (min_end..=hard_end)
            .rev()
            .find(|&end| end > 0 && level.matches(chars, end))
    })
}

fn make_chunk(index: usize, text: String, char_count: usize) -> TextChunk {
    TextChunk {
        index,
        hash: content_hash(&text),
        char_count,
        text,
    }
}

/// SHA-256 of a chunk's text, lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
