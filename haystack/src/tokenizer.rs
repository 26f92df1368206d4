//! Tokenizer seam.
//!
//! The engine treats tokenization as an opaque, reversible encode/decode
//! service. Depth placement is only as accurate as the round trip, so
//! implementations must satisfy `decode(encode(s)) == s` for well-formed text.

/// Pluggable encode/decode service shared read-only by every context build.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids to text. Must not panic on arbitrary slices of an
    /// encoded source; lossy edges are acceptable.
    fn decode(&self, tokens: &[u32]) -> String;

    /// Token count of `text`.
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// One token per Unicode scalar value. Exact inverse; used by tests and for
/// sources where character-level lengths are wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|&t| char::from_u32(t).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}
