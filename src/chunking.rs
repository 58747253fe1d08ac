//! Splitting page text into embedding-sized windows.
//!
//! Pages longer than the chunk size are split on word boundaries into
//! (optionally overlapping) windows. Each chunk keeps the page it came from
//! so per-page vectors can be pooled back into one document vector.

use crate::document::PageContent;

/// Approximate characters per token for English text.
const CHARS_PER_TOKEN: usize = 4;

/// Default chunk size in characters (roughly 512 tokens).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * CHARS_PER_TOKEN;

/// Default overlap between chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 0;

/// How far back to look for whitespace when cutting a chunk.
const BOUNDARY_LOOKBACK: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub page_number: u32,
    pub text: String,
    /// Zero-based chunk index within its page.
    pub index: usize,
    /// Byte offset where this chunk starts in the page text.
    pub start_offset: usize,
}

/// Chunk every non-blank page of a document, in page order.
pub fn chunk_pages(
    pages: &[PageContent],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    pages
        .iter()
        .filter(|p| !p.text.trim().is_empty())
        .flat_map(|p| chunk_text(p.page_number, &p.text, chunk_size, overlap))
        .collect()
}

/// Split text into chunks of at most `chunk_size` characters.
///
/// Short text returns a single chunk. Cuts prefer the last whitespace
/// within [`BOUNDARY_LOOKBACK`] characters of the limit.
pub fn chunk_text(
    page_number: u32,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let char_count = text.chars().count();

    if char_count <= chunk_size {
        return vec![Chunk {
            page_number,
            text: text.to_string(),
            index: 0,
            start_offset: 0,
        }];
    }

    // char index -> byte index, with a sentinel for the end of the text
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut chunks = Vec::new();
    let mut start_char = 0;

    while start_char < char_count {
        let end_char = (start_char + chunk_size).min(char_count);
        let cut = if end_char < char_count {
            word_boundary(text, &char_to_byte, start_char, end_char)
        } else {
            end_char
        };

        let start_byte = char_to_byte[start_char];
        let slice = &text[start_byte..char_to_byte[cut]];
        if !slice.trim().is_empty() {
            chunks.push(Chunk {
                page_number,
                text: slice.to_string(),
                index: chunks.len(),
                start_offset: start_byte,
            });
        }

        if cut >= char_count {
            break;
        }
        start_char = cut.saturating_sub(overlap).max(start_char + 1);

        // Fold a tiny tail into the previous chunk's neighbourhood.
        if char_count.saturating_sub(start_char) < chunk_size / 4
            && !chunks.is_empty()
        {
            let tail_byte = char_to_byte[start_char.min(char_count)];
            let tail = &text[tail_byte..];
            if let Some(last) = chunks.last_mut()
                && !tail.trim().is_empty()
                && last.start_offset + last.text.len() < text.len()
            {
                let from = last.start_offset + last.text.len();
                last.text.push_str(&text[from.max(tail_byte)..]);
            }
            break;
        }
    }

    chunks
}

/// Find a cut point at or before `end_char`, preferring whitespace.
fn word_boundary(
    text: &str,
    char_to_byte: &[usize],
    start_char: usize,
    end_char: usize,
) -> usize {
    let floor = end_char.saturating_sub(BOUNDARY_LOOKBACK).max(start_char + 1);
    let region = &text[char_to_byte[floor]..char_to_byte[end_char]];

    match region.rfind(char::is_whitespace) {
        Some(offset) => {
            let ws_byte = char_to_byte[floor] + offset;
            // char index of the first character after the whitespace
            let idx = char_to_byte.partition_point(|&b| b <= ws_byte);
            idx.min(end_char)
        }
        None => end_char,
    }
}
