use anyhow::{anyhow, Result};
use haystack::Tokenizer;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Tokens trimmed at most from each edge of a slice that splits a character.
const MAX_EDGE_TRIM: usize = 3;

/// BPE tokenizer (`cl100k_base`) for real runs.
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| anyhow!("Failed to load cl100k_base encoding: {e}"))?;
        Ok(Self { bpe })
    }

    fn try_decode(&self, tokens: &[u32]) -> Option<String> {
        self.bpe
            .decode(tokens.iter().map(|&t| t as _).collect())
            .ok()
    }
}

impl std::fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenTokenizer")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    /// A slice of an encoded source can start or end inside a multi-byte
    /// character. Such edges are trimmed, fewest tokens first, until the
    /// bytes decode.
    fn decode(&self, tokens: &[u32]) -> String {
        if let Some(text) = self.try_decode(tokens) {
            return text;
        }
        for total in 1..=2 * MAX_EDGE_TRIM {
            for lead in 0..=total.min(MAX_EDGE_TRIM) {
                let tail = total - lead;
                if tail > MAX_EDGE_TRIM || lead + tail >= tokens.len() {
                    continue;
                }
                if let Some(text) = self.try_decode(&tokens[lead..tokens.len() - tail]) {
                    debug!(lead, tail, "trimmed partial characters at slice edges");
                    return text;
                }
            }
        }
        warn!(
            tokens = tokens.len(),
            "slice does not decode after edge trimming; decoding token by token"
        );
        tokens
            .iter()
            .filter_map(|&t| self.try_decode(&[t]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_whole_text() {
        let tok = TiktokenTokenizer::cl100k().unwrap();
        let text = "The quick brown fox jumps over the lazy dog. 敏捷的棕色狐狸跳过了懒狗。";
        let ids = tok.encode(text);
        assert!(!ids.is_empty());
        assert_eq!(tok.decode(&ids), text);
        assert_eq!(tok.count(text), ids.len());
    }

    #[test]
    fn slices_through_multibyte_characters_never_panic() {
        let tok = TiktokenTokenizer::cl100k().unwrap();
        let text = "在很久很久以前，有一座山🏔️，山里有一座庙。庙里有个老和尚在讲故事。".repeat(3);
        let ids = tok.encode(&text);
        for start in 0..ids.len().min(12) {
            for end in (start + 8).min(ids.len())..ids.len() {
                let piece = tok.decode(&ids[start..end]);
                assert!(text.contains(&piece), "{start}..{end} gave {piece:?}");
            }
        }
    }
}
