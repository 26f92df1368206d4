//! Test orchestration: planning, execution, and recovery.
//!
//! ```text
//! TestPlan::build (feasibility + schedule)
//!   → TestOrchestrator::run / run_recovery
//!       per case: ContextBuilder → ModelCaller → parse_answer → score_answer
//!   → Vec<TestResult> in plan order
//! ```

mod model;
mod plan;
mod recovery;
mod runner;

pub use model::{ModelCaller, ModelReply};
pub use plan::{
    Placement, RunSettings, TestCase, TestPlan, DEFAULT_CONCURRENCY, DEFAULT_PADDING_SIZE,
};
pub use recovery::RecoveryOutcome;
pub use runner::TestOrchestrator;

use crate::results::TestResult;

/// Receives each result as soon as its case completes (completion order).
pub trait ResultObserver: Send + Sync {
    fn on_result(&self, case_index: usize, result: &TestResult);
}
