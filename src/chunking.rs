//! Splitting extracted document text into overlapping chunks.
//!
//! Chunks are the unit that gets embedded, scored and returned by search.
//! Sizes are measured in characters, not bytes, so Hangul and other
//! multi-byte scripts get the same window width as ASCII.

/// Chunk size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            overlap: 80,
        }
    }
}

/// A chunk of text from a larger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Zero-based position among the document's chunks.
    pub index: usize,
    /// Byte offset where this chunk starts in the original text.
    pub start_offset: usize,
}

/// Identifier of the `index`-th chunk of the file keyed `file_key`.
///
/// # Examples
///
/// ```
/// use docseek::chunking::chunk_id;
///
/// assert_eq!(chunk_id("sub/report.pdf", 3), "sub/report.pdf#3");
/// ```
pub fn chunk_id(file_key: &str, index: usize) -> String {
    format!("{file_key}#{index}")
}

/// Split text into overlapping chunks.
///
/// Windows end at the last whitespace within 100 characters of the size
/// limit when there is one. Whitespace-only windows are skipped and a final
/// window shorter than a quarter of `chunk_size` is folded away, since the
/// previous window's overlap already covers most of it.
///
/// # Examples
///
/// ```
/// use docseek::chunking::{chunk_text, ChunkingConfig};
///
/// let config = ChunkingConfig { chunk_size: 1000, overlap: 100 };
/// assert_eq!(chunk_text("Hello, world!", config).len(), 1);
///
/// let text = "word ".repeat(500);
/// assert!(chunk_text(&text, config).len() >= 2);
/// ```
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<Chunk> {
    let chunk_size = config.chunk_size.max(1);
    let char_count = text.chars().count();

    if text.trim().is_empty() {
        return Vec::new();
    }
    if char_count <= chunk_size {
        return vec![Chunk {
            text: text.to_string(),
            index: 0,
            start_offset: 0,
        }];
    }

    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();

    let step = chunk_size.saturating_sub(config.overlap).max(1);
    let mut chunks = Vec::new();
    let mut start_char = 0;

    while start_char < char_count {
        let mut end_char = (start_char + chunk_size).min(char_count);
        if end_char < char_count {
            end_char = word_boundary(text, &char_to_byte, start_char, end_char);
        }

        let start_byte = char_to_byte[start_char];
        let slice = &text[start_byte..char_to_byte[end_char]];
        if !slice.trim().is_empty() {
            chunks.push(Chunk {
                text: slice.to_string(),
                index: chunks.len(),
                start_offset: start_byte,
            });
        }

        start_char += step;
        if char_count.saturating_sub(start_char) < chunk_size / 4
            && !chunks.is_empty()
        {
            break;
        }
    }

    chunks
}

/// Move `end_char` back to just after the nearest whitespace, looking at
/// most 100 characters back and never before `start_char`.
fn word_boundary(
    text: &str,
    char_to_byte: &[usize],
    start_char: usize,
    end_char: usize,
) -> usize {
    let floor = end_char.saturating_sub(100).max(start_char + 1);
    if floor >= end_char {
        return end_char;
    }

    let region = &text[char_to_byte[floor]..char_to_byte[end_char]];
    match region.rfind(char::is_whitespace) {
        Some(offset) => {
            let ws_byte = char_to_byte[floor] + offset;
            // First char index whose byte offset lies past the whitespace.
            char_to_byte.partition_point(|&b| b <= ws_byte)
        }
        None => end_char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            overlap,
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn blank_text_has_no_chunks() {
        assert!(chunk_text("   \n\t ", ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn long_text_overlaps() {
        let text = "word ".repeat(500);
        let chunks = chunk_text(&text, config(1000, 200));

        assert!(chunks.len() >= 2);
        assert_eq!(chunks[1].index, 1);
        let first_end = chunks[0].start_offset + chunks[0].text.len();
        assert!(chunks[1].start_offset < first_end, "chunks should overlap");
    }

    #[test]
    fn breaks_at_whitespace() {
        let text = "abcdefghi ".repeat(300);
        for chunk in chunk_text(&text, config(95, 10)) {
            let trimmed_end = chunk.text.trim_end();
            assert!(
                trimmed_end.ends_with('i') || chunk.text.len() < 95,
                "chunk should end on a word: {:?}",
                chunk.text
            );
        }
    }

    #[test]
    fn indices_are_contiguous() {
        let text = "가나다라 마바사 ".repeat(400);
        let chunks = chunk_text(&text, config(200, 20));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(text[chunk.start_offset..].starts_with(&chunk.text));
        }
    }

    #[test]
    fn covers_most_of_text() {
        let text = "a".repeat(3000);
        let chunks = chunk_text(&text, config(1000, 200));

        assert_eq!(chunks[0].start_offset, 0);
        let last = chunks.last().unwrap();
        assert!(last.start_offset + last.text.len() >= text.len() - 250);
    }

    #[test]
    fn handles_mixed_width_unicode() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(50);
        let chunks = chunk_text(&text, config(100, 20));
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 100);
        }
    }

    #[test]
    fn chunk_ids_embed_index() {
        assert_eq!(chunk_id("a.txt", 0), "a.txt#0");
    }
}
