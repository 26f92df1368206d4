//! Result and run-metadata records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::answer::ScoreMetrics;
use crate::depth::{DepthBin, DepthMode};
use crate::question::{Position, QuestionType};

/// How a result's `model_answer` was obtained, or why it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingStatus {
    Success,
    RegexExtracted,
    ParsingError,
    Timeout,
    Error,
    ContextBuildError,
}

impl ParsingStatus {
    pub const ALL: [ParsingStatus; 6] = [
        ParsingStatus::Success,
        ParsingStatus::RegexExtracted,
        ParsingStatus::ParsingError,
        ParsingStatus::Timeout,
        ParsingStatus::Error,
        ParsingStatus::ContextBuildError,
    ];

    /// Whether recovery keeps a result with this status instead of retrying it.
    pub fn is_kept(self) -> bool {
        matches!(self, Self::Success | Self::RegexExtracted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RegexExtracted => "regex_extracted",
            Self::ParsingError => "parsing_error",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::ContextBuildError => "context_build_error",
        }
    }
}

impl fmt::Display for ParsingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tested assignment. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Position of the question in the question set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_index: Option<usize>,
    pub question: String,
    pub question_type: QuestionType,
    pub choice: BTreeMap<String, String>,
    pub correct_answer: Vec<String>,
    pub model_answer: Vec<String>,
    pub parsing_status: ParsingStatus,
    pub score: f64,
    /// Serialized as `{}` when absent.
    #[serde(
        default,
        serialize_with = "metrics_field::serialize",
        deserialize_with = "metrics_field::deserialize"
    )]
    pub metrics: Option<ScoreMetrics>,
    #[serde(default)]
    pub answer_in_choices: bool,
    /// Measured depth of the evidence window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_depth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_bin: Option<DepthBin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_context_length: Option<usize>,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

mod metrics_field {
    use super::*;
    use serde_json::Value;

    pub fn serialize<S: Serializer>(m: &Option<ScoreMetrics>, s: S) -> Result<S::Ok, S::Error> {
        match m {
            Some(m) => m.serialize(s),
            None => serde_json::Map::new().serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ScoreMetrics>, D::Error> {
        let value = Value::deserialize(d)?;
        match value {
            Value::Null => Ok(None),
            Value::Object(ref map) if map.is_empty() => Ok(None),
            other => ScoreMetrics::deserialize(other)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Bookkeeping attached to metadata of a recovered run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub recovered_at: DateTime<Utc>,
    pub prior_path: String,
    pub kept: usize,
    pub retried: usize,
    pub discarded: usize,
}

/// Header record of a result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub tested_at: DateTime<Utc>,
    pub model_name: String,
    pub source_path: String,
    /// blake3 of the source text; recovery refuses a different source.
    pub source_fingerprint: String,
    pub source_tokens: usize,
    pub question_set_path: String,
    pub depth_mode: DepthMode,
    pub context_lengths: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_depth: Option<f64>,
    pub padding_size: usize,
    pub total_questions: usize,
    pub tested_questions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<usize>,
    #[serde(default)]
    pub sample_seed: u64,
    /// Redacted model/client configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_set_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryInfo>,
}

/// blake3 hex digest of the source text.
pub fn fingerprint_source(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}
