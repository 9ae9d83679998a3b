//! Incremental sentence segmentation for streaming TTS.
//!
//! LLM tokens arrive in arbitrary fragments. [`SentenceSegmenter`] buffers
//! them and releases complete sentences as soon as a terminator (`.`, `?`,
//! `!`) is followed by whitespace, so synthesis can start before the whole
//! reply exists. Whatever is left over is returned by [`SentenceSegmenter::flush`].

/// Splits streamed text into speakable sentences.
///
/// One instance serves exactly one response; it is discarded afterwards.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    /// Create an empty segmenter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completed.
    ///
    /// Sentences are trimmed; the whitespace at each boundary is consumed.
    /// An unterminated tail stays buffered for the next call.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some((end, resume)) = find_sentence_boundary(&self.buffer) {
            let sentence = self.buffer[..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
            self.buffer.drain(..resume);
        }
        sentences
    }

    /// Return the trimmed remainder and reset. May be empty.
    pub fn flush(&mut self) -> String {
        let rest = self.buffer.trim().to_owned();
        self.buffer.clear();
        rest
    }

    /// Drop any buffered text without returning it.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

/// Find the first sentence terminator followed by whitespace.
///
/// Returns `(end, resume)`: `end` is the byte index just past the
/// terminator and `resume` the index past the whitespace run that follows.
/// A terminator at the very end of `text` is not a boundary yet, since the
/// next fragment may continue it (`3.` + `14`).
fn find_sentence_boundary(text: &str) -> Option<(usize, usize)> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let Some(&(_, next)) = chars.peek() else {
            return None;
        };
        if !next.is_whitespace() {
            continue;
        }
        let end = i + c.len_utf8();
        let resume = text[end..]
            .char_indices()
            .find(|(_, ch)| !ch.is_whitespace())
            .map_or(text.len(), |(offset, _)| end + offset);
        return Some((end, resume));
    }
    None
}
