//! # Sentence Segmentation
//!
//! Accumulates streamed text fragments and decides when a sentence-sized unit
//! is ready for synthesis. The decision is a pure function of the buffer
//! content and the flush policy, so it can be tested without any I/O.
//!
//! ## Flush policy (checked in this order after every append):
//! 1. A `.`, `!` or `?` followed by whitespace or end-of-input closes a
//!    sentence; the prefix up to and including the boundary is emitted.
//! 2. The buffer reached the word cap: the first `max_words` words are emitted
//!    even without terminal punctuation.
//! 3. The buffer reached the character cap: the first `max_chars` characters
//!    are emitted.

/// Limits that force a flush when streamed text never reaches terminal
/// punctuation.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Maximum whitespace-delimited words buffered before a forced flush.
    pub max_words: usize,

    /// Maximum characters buffered before a forced flush.
    pub max_chars: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_words: 18,
            max_chars: 200,
        }
    }
}

/// Per-session accumulating text buffer with sentence-flush semantics.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buf: String,
    policy: FlushPolicy,
}

impl SentenceBuffer {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            buf: String::new(),
            policy,
        }
    }

    /// Append one incoming fragment and return every unit that became
    /// flushable as a result, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);

        let mut flushed = Vec::new();
        while let Some(unit) = self.try_flush() {
            flushed.push(unit);
        }
        flushed
    }

    /// Flush the remainder unconditionally. Called when the fragment stream
    /// completes.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buf.trim().to_string();
        self.buf.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// Discard all pending text without flushing (barge-in).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }

    fn try_flush(&mut self) -> Option<String> {
        if let Some(end) = sentence_boundary(&self.buf) {
            return Some(self.split_off_prefix(end));
        }

        if self.buf.split_whitespace().count() >= self.policy.max_words {
            let end = word_prefix_end(&self.buf, self.policy.max_words);
            return Some(self.split_off_prefix(end));
        }

        if self.buf.chars().count() >= self.policy.max_chars {
            let end = char_prefix_end(&self.buf, self.policy.max_chars);
            return Some(self.split_off_prefix(end));
        }

        None
    }

    fn split_off_prefix(&mut self, end: usize) -> String {
        let unit = self.buf[..end].trim().to_string();
        self.buf = self.buf[end..].trim_start().to_string();
        unit
    }
}

/// Byte offset just past the first sentence-terminating character that is
/// followed by whitespace or end-of-input, if any.
fn sentence_boundary(buf: &str) -> Option<usize> {
    let mut chars = buf.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            match chars.peek() {
                None => return Some(i + c.len_utf8()),
                Some((_, next)) if next.is_whitespace() => return Some(i + c.len_utf8()),
                _ => {}
            }
        }
    }
    None
}

/// Byte offset at the end of the n-th whitespace-delimited word.
fn word_prefix_end(buf: &str, n: usize) -> usize {
    let mut words = 0;
    let mut prev_ws = true;
    for (i, c) in buf.char_indices() {
        let ws = c.is_whitespace();
        if prev_ws && !ws {
            words += 1;
        }
        if !prev_ws && ws && words == n {
            return i;
        }
        prev_ws = ws;
    }
    buf.len()
}

/// Byte offset of the n-th character (not byte), clamped to the buffer end.
fn char_prefix_end(buf: &str, n: usize) -> usize {
    buf.char_indices().nth(n).map(|(i, _)| i).unwrap_or(buf.len())
}
