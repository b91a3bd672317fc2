//! Paragraph-greedy chunking with a character-based token estimate.
//!
//! Token counts are estimated as `ceil(chars / 3.5)` rather than with a model tokenizer, which
//! keeps chunk boundaries identical across providers for the same text. Paragraphs are packed into
//! a running buffer until the next one would overflow `max_tokens`; each new buffer is seeded with
//! the tail of the previous one so text near a boundary stays retrievable from both sides.

use super::extract::PageText;

/// Fragments shorter than this many characters are dropped.
pub const MIN_FRAGMENT_CHARS: usize = 20;
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// One chunk of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Ordinal, contiguous from 0.
    pub index: usize,
    /// Chunk text.
    pub content: String,
    /// Estimated token count of `content`.
    pub token_count: usize,
    /// First page the chunk covers.
    pub page_start: u32,
    /// Last page the chunk covers.
    pub page_end: u32,
    /// Bytes at the start of `content` repeated from the previous chunk.
    pub overlap_bytes: usize,
}

/// Estimated token count: `ceil(chars / 3.5)`.
pub fn estimate_tokens(text: &str) -> usize {
    estimate_for_chars(text.chars().count())
}

fn estimate_for_chars(chars: usize) -> usize {
    (chars * 2).div_ceil(7)
}

/// Characters of overlap carried for `overlap_tokens` tokens.
pub fn overlap_chars(overlap_tokens: usize) -> usize {
    overlap_tokens * 7 / 2
}

/// Split a page into trimmed paragraphs, dropping short fragments.
///
/// A paragraph ends at a blank line, or at a line break that follows sentence-ending punctuation.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    let mut flush = |current: &mut Vec<&str>| {
        let paragraph = current.join("\n");
        let paragraph = paragraph.trim();
        if paragraph.chars().count() >= MIN_FRAGMENT_CHARS {
            paragraphs.push(paragraph.to_string());
        }
        current.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut current);
            continue;
        }
        current.push(trimmed);
        if trimmed.ends_with(['.', '!', '?']) {
            flush(&mut current);
        }
    }
    flush(&mut current);

    paragraphs
}

struct Buffer {
    text: String,
    chars: usize,
    page_start: u32,
    page_end: u32,
    overlap_bytes: usize,
}

impl Buffer {
    fn empty(page: u32) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            page_start: page,
            page_end: page,
            overlap_bytes: 0,
        }
    }

    fn seeded(seed: String, page: u32) -> Self {
        let chars = seed.chars().count();
        Self {
            overlap_bytes: seed.len(),
            text: seed,
            chars,
            page_start: page,
            page_end: page,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn chars_with(&self, paragraph_chars: usize) -> usize {
        if self.text.is_empty() {
            paragraph_chars
        } else {
            self.chars + PARAGRAPH_SEPARATOR.len() + paragraph_chars
        }
    }

    fn push(&mut self, paragraph: &str, paragraph_chars: usize, page: u32) {
        if self.text.is_empty() {
            self.page_start = page;
        } else {
            self.text.push_str(PARAGRAPH_SEPARATOR);
            if self.overlap_bytes == self.text.len() - PARAGRAPH_SEPARATOR.len() {
                self.overlap_bytes = self.text.len();
            }
        }
        self.chars = self.chars_with(paragraph_chars);
        self.text.push_str(paragraph);
        self.page_end = page;
    }

    fn tail(&self, chars: usize) -> String {
        let skip = self.chars.saturating_sub(chars);
        self.text.chars().skip(skip).collect::<String>().trim_start().to_string()
    }

    fn into_chunk(self, index: usize) -> TextChunk {
        TextChunk {
            index,
            token_count: estimate_for_chars(self.chars),
            content: self.text,
            page_start: self.page_start,
            page_end: self.page_end,
            overlap_bytes: self.overlap_bytes,
        }
    }
}

/// Chunk pages in document order.
pub fn chunk_pages(pages: &[PageText], max_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    let max_tokens = max_tokens.max(1);
    let overlap = overlap_chars(overlap_tokens);
    let mut chunks = Vec::new();
    let mut buffer: Option<Buffer> = None;

    for page in pages {
        for paragraph in split_paragraphs(&page.text) {
            let paragraph_chars = paragraph.chars().count();
            let current = buffer.get_or_insert_with(|| Buffer::empty(page.number));

            if !current.is_empty()
                && estimate_for_chars(current.chars_with(paragraph_chars)) > max_tokens
            {
                let previous = std::mem::replace(current, Buffer::empty(page.number));
                let seed = previous.tail(overlap);
                let seed_page = previous.page_end;
                chunks.push(previous.into_chunk(chunks.len()));

                let seeded = Buffer::seeded(seed, seed_page);
                if !seeded.text.is_empty()
                    && estimate_for_chars(seeded.chars_with(paragraph_chars)) <= max_tokens
                {
                    *current = seeded;
                }
            }

            current.push(&paragraph, paragraph_chars, page.number);
        }
    }

    if let Some(last) = buffer
        && last.text.trim().chars().count() > MIN_FRAGMENT_CHARS
    {
        chunks.push(last.into_chunk(chunks.len()));
    }

    chunks
}
