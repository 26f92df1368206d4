//! Depth-targeted context construction over a shared token array.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::ContextBuildResult;
use crate::question::Question;
use crate::tokenizer::Tokenizer;

/// Builds contexts from one tokenized source.
///
/// The source tokens are shared read-only between every concurrent build; a
/// build is a pure function of its arguments.
#[derive(Clone)]
pub struct ContextBuilder {
    tokenizer: Arc<dyn Tokenizer>,
    source: Arc<[u32]>,
}

impl fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("source_tokens", &self.source.len())
            .finish()
    }
}

impl ContextBuilder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, source: Arc<[u32]>) -> Self {
        Self { tokenizer, source }
    }

    /// Tokenize `text` once and build over the result.
    pub fn from_text(tokenizer: Arc<dyn Tokenizer>, text: &str) -> Self {
        let source: Arc<[u32]> = tokenizer.encode(text).into();
        Self { tokenizer, source }
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    /// The first `context_length` tokens of the source, decoded.
    pub fn prefix(&self, context_length: usize) -> String {
        let end = context_length.min(self.source.len());
        self.tokenizer.decode(&self.source[..end])
    }

    /// Build a context of `context_length` tokens with the padded evidence
    /// window of `question` at `target_depth`.
    ///
    /// Filler is taken contiguously from the source around the window. When
    /// one side of the source is too short, the other side makes up the
    /// difference, so the measured depth moves away from the target but the
    /// total length is kept. Never panics; failures come back with
    /// `success == false`.
    pub fn build(
        &self,
        question: &Question,
        target_depth: f64,
        context_length: usize,
        padding: usize,
    ) -> ContextBuildResult {
        if !(0.0..=1.0).contains(&target_depth) {
            return ContextBuildResult::failure(format!(
                "Invalid target_depth: {target_depth}, must be between 0.0 and 1.0"
            ));
        }

        let source_len = self.source.len();
        let pos = question.position;
        if pos.end_pos < pos.start_pos {
            return ContextBuildResult::failure(format!(
                "Invalid evidence span: end_pos ({}) is before start_pos ({})",
                pos.end_pos, pos.start_pos
            ));
        }
        if pos.start_pos >= source_len {
            return ContextBuildResult::failure(format!(
                "Evidence start ({}) lies outside the source ({source_len} tokens)",
                pos.start_pos
            ));
        }

        let (window_start, window_end) = pos.padded_window(padding, source_len);
        let evidence_length = window_end - window_start;
        if evidence_length >= context_length {
            return ContextBuildResult::failure(format!(
                "Evidence length ({evidence_length}) exceeds context length ({context_length})"
            ));
        }

        let available = context_length - evidence_length;
        let before = window_start;
        let after = source_len - window_end;

        let wanted_prefix = ((available as f64) * target_depth).round() as usize;
        let wanted_prefix = wanted_prefix.min(available);

        let mut prefix_length = wanted_prefix.min(before);
        let suffix_length = (available - prefix_length).min(after);
        prefix_length = (available - suffix_length).min(before);

        if prefix_length != wanted_prefix {
            debug!(
                wanted_prefix,
                prefix_length,
                suffix_length,
                before,
                after,
                "filler redistributed around source boundary"
            );
        }

        let start = window_start - prefix_length;
        let end = window_end + suffix_length;
        let total_length = end - start;
        if total_length < context_length {
            warn!(
                requested = context_length,
                built = total_length,
                "source too short to fill requested context length"
            );
        }

        let context = self.tokenizer.decode(&self.source[start..end]);
        let actual_depth = if total_length > 0 {
            prefix_length as f64 / total_length as f64
        } else {
            0.0
        };

        ContextBuildResult {
            context,
            actual_depth,
            evidence_start: prefix_length,
            evidence_end: prefix_length + evidence_length,
            prefix_length,
            suffix_length,
            evidence_length,
            total_length,
            success: true,
            error_message: None,
        }
    }
}
