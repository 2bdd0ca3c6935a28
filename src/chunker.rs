//! Chunker (C3): splits file text into overlapping, size-bounded chunks with
//! deterministic IDs, independent of any language grammar.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ChunkerOptions {
    pub target_chars: usize,
    pub max_chars: usize,
    pub overlap_ratio: f64,
    pub respect_line_breaks: bool,
    pub respect_word_boundaries: bool,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            target_chars: 4000,
            max_chars: 6000,
            overlap_ratio: 0.15,
            respect_line_breaks: true,
            respect_word_boundaries: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: String,
    pub relative_path: String,
    pub byte_range: (usize, usize),
    pub line_range: (u32, u32),
    pub text: String,
    pub token_estimate: usize,
}

fn chunk_id(relative_path: &str, byte_offset: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    hasher.update(b":");
    hasher.update(byte_offset.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Finds the best split point in `chars[search_from..=end]`, preferring a
/// newline, then ASCII whitespace, falling back to `end` itself.
fn find_split(chars: &[char], search_from: usize, end: usize, opts: &ChunkerOptions) -> usize {
    if opts.respect_line_breaks {
        for i in (search_from..end).rev() {
            if chars[i] == '\n' {
                return i + 1;
            }
        }
    }
    if opts.respect_word_boundaries {
        for i in (search_from..end).rev() {
            if chars[i].is_ascii_whitespace() {
                return i + 1;
            }
        }
    }
    end
}

/// Splits `text` into overlapping chunks covering the entire input. Adjacent
/// chunks overlap by `floor(target_chars * overlap_ratio)` characters.
/// Empty or whitespace-only text produces zero chunks.
pub fn chunk_text(relative_path: &str, text: &str, opts: &ChunkerOptions) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let overlap = ((opts.target_chars as f64) * opts.overlap_ratio).floor() as usize;

    // Precompute byte offsets and 1-based line numbers per char index so we
    // can report byte_range/line_range without re-scanning from the start.
    let mut byte_offsets = Vec::with_capacity(len + 1);
    let mut line_numbers = Vec::with_capacity(len + 1);
    let mut byte_acc = 0usize;
    let mut line_acc = 1u32;
    for &c in &chars {
        byte_offsets.push(byte_acc);
        line_numbers.push(line_acc);
        byte_acc += c.len_utf8();
        if c == '\n' {
            line_acc += 1;
        }
    }
    byte_offsets.push(byte_acc);
    line_numbers.push(line_acc);

    let mut chunks = Vec::new();
    let mut i = 0usize;

    while i < len {
        let mut end = (i + opts.target_chars).min(len);
        if i + opts.target_chars < len {
            let window_start = end.saturating_sub(opts.target_chars / 4).max(i);
            end = find_split(&chars, window_start, end, opts);
        }
        end = end.min(i + opts.max_chars).min(len);
        if end <= i {
            end = (i + 1).min(len);
        }

        let slice: String = chars[i..end].iter().collect();
        let byte_offset = byte_offsets[i];
        let start_line = line_numbers[i];
        let end_line = if end > i { line_numbers[end - 1] } else { start_line };

        chunks.push(Chunk {
            chunk_id: chunk_id(relative_path, byte_offset, &slice),
            relative_path: relative_path.to_string(),
            byte_range: (byte_offset, byte_offsets[end]),
            line_range: (start_line, end_line),
            token_estimate: (slice.len() + 2) / 3,
            text: slice,
        });

        if end == len {
            break;
        }
        let next = end.saturating_sub(overlap);
        i = if next > i { next } else { end };
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("a.txt", "", &ChunkerOptions::default()).is_empty());
        assert!(chunk_text("a.txt", "   \n\t", &ChunkerOptions::default()).is_empty());
    }

    #[test]
    fn short_file_is_a_single_chunk() {
        let chunks = chunk_text("hello.txt", "hello world\n", &ChunkerOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_range, (1, 1));
        assert_eq!(chunks[0].text, "hello world\n");
    }

    #[test]
    fn determinism_same_text_same_path_same_ids() {
        let opts = ChunkerOptions {
            target_chars: 50,
            max_chars: 80,
            ..Default::default()
        };
        let text = "line one\nline two\nline three\nline four\nline five\nline six\n".repeat(3);
        let a = chunk_text("src/lib.rs", &text, &opts);
        let b = chunk_text("src/lib.rs", &text, &opts);
        assert_eq!(a.len(), b.len());
        for (ca, cb) in a.iter().zip(b.iter()) {
            assert_eq!(ca.chunk_id, cb.chunk_id);
        }
        assert!(a.len() > 1, "expected the repeated text to produce multiple chunks");
    }

    #[test]
    fn chunks_cover_entire_text_with_overlap() {
        let opts = ChunkerOptions {
            target_chars: 40,
            max_chars: 60,
            overlap_ratio: 0.25,
            respect_line_breaks: true,
            respect_word_boundaries: true,
        };
        let text = "abcdefghij ".repeat(20);
        let chunks = chunk_text("f.txt", &text, &opts);
        assert!(chunks.len() > 1);
        // Final chunk ends exactly at text end.
        let total_bytes = text.len();
        assert_eq!(chunks.last().unwrap().byte_range.1, total_bytes);
        // Consecutive chunks overlap: next chunk's start <= previous chunk's end.
        for w in chunks.windows(2) {
            assert!(w[1].byte_range.0 <= w[0].byte_range.1);
        }
    }

    #[test]
    fn max_chars_is_enforced() {
        let opts = ChunkerOptions {
            target_chars: 1000,
            max_chars: 1000,
            overlap_ratio: 0.0,
            respect_line_breaks: false,
            respect_word_boundaries: false,
        };
        let text = "x".repeat(5000);
        let chunks = chunk_text("f.txt", &text, &opts);
        for c in &chunks {
            assert!(c.text.len() <= opts.max_chars);
        }
    }
}
