//! Incremental sentence segmentation over a streamed token sequence.
//!
//! The dialog model streams tokens; synthesis wants whole sentences. The
//! segmenter buffers tokens and cuts at terminal punctuation so the first
//! sentence can start synthesizing while the model is still generating.

use crate::emotion;

/// Characters that end a sentence.
const SENTENCE_TERMINALS: [char; 5] = ['。', '！', '？', '；', '\n'];

/// Stateful accumulator fed by incoming LLM tokens.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    /// Create an empty segmenter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token and return every sentence completed by it.
    ///
    /// A sentence is everything buffered up to and including a terminal
    /// character, trimmed; empty results are dropped. A single token may
    /// complete several sentences.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        loop {
            let Some(pos) = self.buffer.find(&SENTENCE_TERMINALS[..]) else {
                break;
            };
            let terminal_len = self.buffer[pos..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
            let rest = self.buffer.split_off(pos + terminal_len);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
        }
        sentences
    }

    /// Flush the remaining buffer at stream end.
    ///
    /// Mood tags are stripped first; the remainder is returned iff it is
    /// still non-empty. The segmenter is reset either way.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let cleaned = emotion::strip(&rest);
        if cleaned.is_empty() { None } else { Some(cleaned) }
    }
}
