//! Sentence boundary segmentation for streamed text.
//!
//! A boundary is `.`, `!`, `?` or a newline that is not immediately followed by another boundary
//! character. The end of the buffered text counts as "not followed", so a chunk ending in `.`
//! releases its sentence right away. A boundary closing fewer than two non-whitespace characters
//! is ignored and the text carries over into the next sentence.

const MIN_SENTENCE_CHARS: usize = 2;

pub fn is_boundary(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

/// Accumulates streamed text and releases complete sentences.
#[derive(Debug, Default, Clone)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return every sentence completed by it, in order.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut sentences = Vec::new();
        let mut start = 0;
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !is_boundary(c) {
                continue;
            }
            if chars.peek().is_some_and(|&(_, next)| is_boundary(next)) {
                continue;
            }
            let end = i + c.len_utf8();
            let candidate = self.buffer[start..end].trim();
            if candidate.chars().filter(|ch| !ch.is_whitespace()).count() >= MIN_SENTENCE_CHARS {
                sentences.push(candidate.to_string());
                start = end;
            }
        }

        self.buffer.drain(..start);
        sentences
    }

    /// Release whatever is left as a final sentence.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Text held back waiting for a boundary.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Split a complete block of text into sentences, remainder included.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut splitter = SentenceSplitter::new();
    let mut sentences = splitter.push(text);
    sentences.extend(splitter.flush());
    sentences
}
