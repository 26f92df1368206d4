//! Aggregate statistics over a finished run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::{ParsingStatus, TestResult};
use crate::depth::DepthBin;
use crate::question::QuestionType;

/// Count and mean score for one aggregation cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CellStat {
    pub count: usize,
    pub mean_score: f64,
}

/// Run-level rollup logged at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub by_status: BTreeMap<ParsingStatus, usize>,
    pub by_question_type: BTreeMap<QuestionType, usize>,
    pub mean_score: f64,
    /// Fraction of single-choice results scored 1.0.
    pub single_choice_accuracy: Option<f64>,
    /// Mean F1 over multiple-choice results.
    pub multiple_choice_f1: Option<f64>,
    pub by_depth_bin: BTreeMap<DepthBin, CellStat>,
    pub by_context_length: BTreeMap<usize, CellStat>,
}

#[derive(Default)]
struct Acc {
    count: usize,
    sum: f64,
}

impl Acc {
    fn add(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn stat(&self) -> CellStat {
        CellStat {
            count: self.count,
            mean_score: self.mean().unwrap_or(0.0),
        }
    }
}

impl RunSummary {
    pub fn from_results(results: &[TestResult]) -> Self {
        if results.is_empty() {
            return Self::default();
        }

        let mut by_status = BTreeMap::new();
        let mut by_question_type = BTreeMap::new();
        let mut overall = Acc::default();
        let mut single = Acc::default();
        let mut multi = Acc::default();
        let mut per_bin: BTreeMap<DepthBin, Acc> = BTreeMap::new();
        let mut per_length: BTreeMap<usize, Acc> = BTreeMap::new();

        for r in results {
            *by_status.entry(r.parsing_status).or_insert(0) += 1;
            *by_question_type.entry(r.question_type).or_insert(0) += 1;
            overall.add(r.score);

            match r.question_type {
                QuestionType::SingleChoice => single.add(if r.score >= 1.0 { 1.0 } else { 0.0 }),
                QuestionType::MultipleChoice => {
                    multi.add(r.metrics.map(|m| m.f1).unwrap_or(0.0))
                }
                _ => {}
            }

            if let Some(bin) = r.depth_bin {
                per_bin.entry(bin).or_default().add(r.score);
            }
            if let Some(length) = r.test_context_length {
                per_length.entry(length).or_default().add(r.score);
            }
        }

        Self {
            total: results.len(),
            by_status,
            by_question_type,
            mean_score: overall.mean().unwrap_or(0.0),
            single_choice_accuracy: single.mean(),
            multiple_choice_f1: multi.mean(),
            by_depth_bin: per_bin.into_iter().map(|(k, a)| (k, a.stat())).collect(),
            by_context_length: per_length.into_iter().map(|(k, a)| (k, a.stat())).collect(),
        }
    }

    pub fn status_count(&self, status: ParsingStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Emit the summary through `tracing`.
    pub fn log(&self) {
        info!(
            total = self.total,
            mean_score = self.mean_score,
            single_choice_accuracy = ?self.single_choice_accuracy,
            multiple_choice_f1 = ?self.multiple_choice_f1,
            "test summary"
        );
        for status in ParsingStatus::ALL {
            let count = self.status_count(status);
            if count > 0 {
                info!(status = %status, count, "parsing status");
            }
        }
        for (bin, cell) in &self.by_depth_bin {
            info!(depth_bin = %bin, count = cell.count, mean_score = cell.mean_score, "by depth");
        }
        for (length, cell) in &self.by_context_length {
            info!(
                context_length = length,
                count = cell.count,
                mean_score = cell.mean_score,
                "by context length"
            );
        }
    }
}
