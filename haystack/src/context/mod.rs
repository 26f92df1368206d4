//! Test-context assembly.
//!
//! A context is `[prefix filler][evidence window][suffix filler]`, cut from
//! the tokenized source so that the evidence window lands at a requested
//! relative depth.

mod builder;

use serde::{Deserialize, Serialize};

pub use builder::ContextBuilder;

/// Outcome of one context build. All lengths and offsets are in tokens.
///
/// When `success` is true, `prefix_length + evidence_length + suffix_length
/// == total_length` and `total_length` never exceeds the requested length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBuildResult {
    pub context: String,
    /// Measured depth `prefix_length / total_length`; use this, not the request.
    pub actual_depth: f64,
    /// Offset of the evidence window within the context.
    pub evidence_start: usize,
    pub evidence_end: usize,
    pub prefix_length: usize,
    pub suffix_length: usize,
    pub evidence_length: usize,
    pub total_length: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ContextBuildResult {
    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self {
            context: String::new(),
            actual_depth: 0.0,
            evidence_start: 0,
            evidence_end: 0,
            prefix_length: 0,
            suffix_length: 0,
            evidence_length: 0,
            total_length: 0,
            success: false,
            error_message: Some(message.into()),
        }
    }
}
