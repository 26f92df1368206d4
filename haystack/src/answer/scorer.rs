//! Exact-match and F1 scoring.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::question::QuestionType;

/// Set-overlap metrics for multiple-choice questions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1_score", alias = "f1")]
    pub f1: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub score: f64,
    pub metrics: Option<ScoreMetrics>,
}

impl Score {
    fn zero() -> Self {
        Self {
            score: 0.0,
            metrics: None,
        }
    }
}

/// Score `predicted` against `labeled`.
///
/// Single-choice and negative questions need an exact ordered match.
/// Multiple-choice questions score F1 over the key sets and always carry
/// their metrics. An empty prediction always scores zero.
pub fn score_answer(
    labeled: &[String],
    predicted: &[String],
    question_type: QuestionType,
) -> Score {
    match question_type {
        QuestionType::SingleChoice | QuestionType::NegativeQuestion => Score {
            score: if !predicted.is_empty() && predicted == labeled {
                1.0
            } else {
                0.0
            },
            metrics: None,
        },
        QuestionType::MultipleChoice => {
            let metrics = overlap(labeled, predicted);
            Score {
                score: metrics.f1,
                metrics: Some(metrics),
            }
        }
        QuestionType::Unknown => Score::zero(),
    }
}

fn overlap(labeled: &[String], predicted: &[String]) -> ScoreMetrics {
    let labeled: HashSet<&str> = labeled.iter().map(String::as_str).collect();
    let predicted: HashSet<&str> = predicted.iter().map(String::as_str).collect();
    let hits = labeled.intersection(&predicted).count() as f64;

    let precision = if predicted.is_empty() {
        0.0
    } else {
        hits / predicted.len() as f64
    };
    let recall = if labeled.is_empty() {
        0.0
    } else {
        hits / labeled.len() as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    ScoreMetrics {
        precision,
        recall,
        f1,
    }
}
