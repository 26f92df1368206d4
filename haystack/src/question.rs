//! Question records produced by the upstream generator and validator.
//!
//! Read-only here: the engine never mutates a question, it only echoes its
//! fields into the `TestResult` it produces.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Kind of question; drives scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    NegativeQuestion,
    /// Anything the generator emitted that this engine does not know how to score.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleChoice => write!(f, "single_choice"),
            Self::MultipleChoice => write!(f, "multiple_choice"),
            Self::NegativeQuestion => write!(f, "negative_question"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Half-open token span `[start_pos, end_pos)` of the evidence in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub start_pos: usize,
    pub end_pos: usize,
}

impl Position {
    pub fn new(start_pos: usize, end_pos: usize) -> Self {
        Self { start_pos, end_pos }
    }

    /// Number of evidence tokens (without padding).
    pub fn len(&self) -> usize {
        self.end_pos.saturating_sub(self.start_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evidence window widened by `padding` on both sides and clamped to the source.
    pub fn padded_window(&self, padding: usize, source_len: usize) -> (usize, usize) {
        let start = self.start_pos.saturating_sub(padding).min(source_len);
        let end = self.end_pos.saturating_add(padding).min(source_len);
        (start, end.max(start))
    }
}

/// Validation block written by the external hallucination/evidence validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
}

/// A single test question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub question_type: QuestionType,
    /// Option key (e.g. `"a"`) to option text.
    pub choice: BTreeMap<String, String>,
    /// Labeled answer keys.
    pub answer: Vec<String>,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

impl Question {
    /// Short preview of the question text for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.question.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }

    /// Check the structural invariants of the data model.
    pub fn check_shape(&self, index: usize) -> EngineResult<()> {
        let fail = |message: String| EngineError::InvalidQuestion { index, message };

        if self.position.end_pos < self.position.start_pos {
            return Err(fail(format!(
                "end_pos ({}) is before start_pos ({})",
                self.position.end_pos, self.position.start_pos
            )));
        }
        if self.choice.len() < 2 {
            return Err(fail(format!(
                "expected at least 2 choices, found {}",
                self.choice.len()
            )));
        }
        if self.answer.is_empty() {
            return Err(fail("labeled answer is empty".to_string()));
        }
        if let Some(missing) = self.answer.iter().find(|k| !self.choice.contains_key(*k)) {
            return Err(fail(format!("labeled answer {missing:?} is not a choice key")));
        }
        Ok(())
    }
}
