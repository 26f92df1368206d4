//! Pre-flight question gate.
//!
//! Refuses to spend model calls on questions the upstream validator has not
//! seen or has rejected. Synchronous and side-effect free apart from logging.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::question::Question;

const PREVIEW_CHARS: usize = 50;
const MAX_LOGGED: usize = 10;

/// Diagnostic for one checked question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub index: usize,
    pub question_preview: String,
    pub has_validation: bool,
    pub is_valid: Option<bool>,
    pub failure_reasons: Vec<String>,
}

/// Batch filter over the `validation` block of each question.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuestionGate;

impl QuestionGate {
    /// Return the accepted questions plus one diagnostic per checked question.
    ///
    /// Missing validation always rejects the batch. Invalid questions reject
    /// it unless `ignore_invalid` is set, in which case they are dropped. An
    /// empty result rejects it too. `skip_validation` bypasses everything.
    pub fn check(
        questions: &[Question],
        skip_validation: bool,
        ignore_invalid: bool,
    ) -> EngineResult<(Vec<Question>, Vec<CheckResult>)> {
        let (accepted, diagnostics) =
            Self::check_indices(questions, skip_validation, ignore_invalid)?;
        let accepted = accepted.into_iter().map(|i| questions[i].clone()).collect();
        Ok((accepted, diagnostics))
    }

    /// Same as [`QuestionGate::check`], returning accepted positions in `questions`.
    pub fn check_indices(
        questions: &[Question],
        skip_validation: bool,
        ignore_invalid: bool,
    ) -> EngineResult<(Vec<usize>, Vec<CheckResult>)> {
        if skip_validation {
            info!(questions = questions.len(), "validation check skipped");
            return Ok(((0..questions.len()).collect(), Vec::new()));
        }

        let mut diagnostics = Vec::with_capacity(questions.len());
        let mut missing = Vec::new();
        let mut invalid = Vec::new();
        let mut accepted = Vec::new();

        for (index, q) in questions.iter().enumerate() {
            let question_preview = q.preview(PREVIEW_CHARS);
            let result = match &q.validation {
                None => CheckResult {
                    index,
                    question_preview,
                    has_validation: false,
                    is_valid: None,
                    failure_reasons: vec!["Missing 'validation' field".to_string()],
                },
                Some(v) => CheckResult {
                    index,
                    question_preview,
                    has_validation: true,
                    is_valid: Some(v.is_valid),
                    failure_reasons: if v.is_valid {
                        Vec::new()
                    } else {
                        v.failure_reasons.clone()
                    },
                },
            };

            match result.is_valid {
                None => missing.push(result.clone()),
                Some(false) => invalid.push(result.clone()),
                Some(true) => accepted.push(index),
            }
            diagnostics.push(result);
        }

        if !missing.is_empty() {
            log_offenders("questions without validation metadata", &missing);
            return Err(EngineError::batch_rejected(
                format!(
                    "{} questions lack validation metadata; run the validator first",
                    missing.len()
                ),
                missing,
            ));
        }

        if !invalid.is_empty() {
            if ignore_invalid {
                for r in &invalid {
                    warn!(
                        index = r.index,
                        question = %r.question_preview,
                        reasons = ?r.failure_reasons,
                        "dropping invalid question"
                    );
                }
                info!(dropped = invalid.len(), "invalid questions filtered out");
            } else {
                log_offenders("questions that failed validation", &invalid);
                return Err(EngineError::batch_rejected(
                    format!(
                        "{} questions failed validation; pass ignore-invalid to drop them",
                        invalid.len()
                    ),
                    invalid,
                ));
            }
        }

        if accepted.is_empty() {
            return Err(EngineError::batch_rejected(
                "no valid questions remain after filtering",
                diagnostics,
            ));
        }

        info!(
            accepted = accepted.len(),
            total = questions.len(),
            "question pre-check passed"
        );
        Ok((accepted, diagnostics))
    }
}

fn log_offenders(what: &str, offenders: &[CheckResult]) {
    error!(count = offenders.len(), "validation check failed: {what}");
    for r in offenders.iter().take(MAX_LOGGED) {
        error!(
            index = r.index,
            question = %r.question_preview,
            reasons = ?r.failure_reasons.iter().take(2).collect::<Vec<_>>(),
            "offending question"
        );
    }
    if offenders.len() > MAX_LOGGED {
        error!(more = offenders.len() - MAX_LOGGED, "further offenders not shown");
    }
}
