//! Re-running only the failed or missing cases of a prior run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::model::ModelCaller;
use super::plan::{CaseKey, TestPlan};
use super::runner::TestOrchestrator;
use crate::error::EngineResult;
use crate::question::Question;
use crate::results::TestResult;

/// Merged results of a recovery plus what happened to the prior records.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// One result per plan case, in plan order.
    pub results: Vec<TestResult>,
    /// Prior results carried over unchanged.
    pub kept: usize,
    /// Cases that were re-run (failed before, or never attempted).
    pub retried: usize,
    /// Prior records that match no case of the plan.
    pub discarded: usize,
}

impl TestOrchestrator {
    /// Resume a prior run against the same plan.
    ///
    /// Prior records are matched to cases by question index, plus depth bin
    /// and context length for depth-aware plans, so each retried case keeps
    /// the grid point it had. A successful or regex-extracted record is kept;
    /// everything else, including cases with no record, is re-run.
    pub async fn run_recovery(
        &self,
        prior: Vec<TestResult>,
        questions: Arc<[Question]>,
        plan: &TestPlan,
        caller: Arc<dyn ModelCaller>,
    ) -> EngineResult<RecoveryOutcome> {
        plan.check_against(questions.len())?;

        let case_of: HashMap<CaseKey, usize> = plan
            .cases()
            .iter()
            .enumerate()
            .map(|(idx, case)| (case.key(), idx))
            .collect();

        let mut best: HashMap<usize, TestResult> = HashMap::new();
        let mut discarded = 0usize;
        for record in prior {
            let Some(&case_idx) = record_key(&record).and_then(|k| case_of.get(&k)) else {
                warn!(
                    question = ?record.question_index,
                    depth_bin = ?record.depth_bin,
                    context_length = ?record.test_context_length,
                    "prior record matches no case of the current plan; discarding"
                );
                discarded += 1;
                continue;
            };
            match best.get(&case_idx) {
                Some(existing)
                    if existing.parsing_status.is_kept() && !record.parsing_status.is_kept() =>
                {
                    debug!(case = case_idx, "keeping earlier successful record over later failure");
                }
                _ => {
                    best.insert(case_idx, record);
                }
            }
        }

        let retry: Vec<usize> = (0..plan.len())
            .filter(|idx| !best.get(idx).is_some_and(|r| r.parsing_status.is_kept()))
            .collect();
        let kept = plan.len() - retry.len();

        info!(
            cases = plan.len(),
            kept,
            retry = retry.len(),
            discarded,
            "recovery partitioned prior results"
        );

        let mut fresh = if retry.is_empty() {
            HashMap::new()
        } else {
            self.run_cases(questions, plan, &retry, caller).await
        };

        let results = (0..plan.len())
            .filter_map(|idx| fresh.remove(&idx).or_else(|| best.remove(&idx)))
            .collect();

        Ok(RecoveryOutcome {
            results,
            kept,
            retried: retry.len(),
            discarded,
        })
    }
}

fn record_key(record: &TestResult) -> Option<CaseKey> {
    let question_index = record.question_index?;
    let cell = match (record.depth_bin, record.test_context_length) {
        (Some(bin), Some(length)) => Some((bin, length)),
        _ => None,
    };
    Some(CaseKey {
        question_index,
        cell,
    })
}
