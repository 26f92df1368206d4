//! Haystack: depth-aware long-context recall testing
//!
//! This library provides the engine that measures how well a language model
//! recalls a fact ("evidence") planted at a controlled depth inside a context
//! window of controlled size:
//!
//! - **Depth scheduling**: balanced (depth × context length) assignment per question
//! - **Context building**: token-accurate splicing of filler around an evidence window
//! - **Question gate**: pre-flight rejection of unvalidated or invalid questions
//! - **Orchestration**: bounded-concurrency execution with per-assignment failure capture
//!   and recovery of partially failed runs
//! - **Answer parsing and scoring**: layered JSON extraction plus exact/F1 scoring
//!
//! # Data flow
//!
//! ```text
//! Questions + source tokens
//!   → QuestionGate (filter)
//!   → TestPlan (feasibility pre-check + DepthScheduler)
//!   → per case: ContextBuilder → ModelCaller → AnswerParser → Scorer
//!   → TestResult stream (+ RunMetadata header)
//! ```
//!
//! Model invocation and tokenization are seams ([`ModelCaller`], [`Tokenizer`]);
//! concrete implementations live in the `haystack-bench` binary crate.

#![allow(clippy::uninlined_format_args)]

pub mod answer;
pub mod context;
pub mod depth;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod prompt;
pub mod question;
pub mod results;
pub mod tokenizer;

pub use error::{EngineError, EngineResult};

pub use question::{Position, Question, QuestionType, Validation};

pub use tokenizer::{CharTokenizer, Tokenizer};

pub use depth::{
    balanced_sample, DepthAssignment, DepthBin, DepthMode, DepthScheduler, DEPTH_BIN_COUNT,
};

pub use context::{ContextBuildResult, ContextBuilder};

pub use gate::{CheckResult, QuestionGate};

pub use answer::{is_valid_answer, parse_answer, score_answer, ParsedAnswer, Score, ScoreMetrics};

pub use prompt::PromptTemplate;

pub use results::{
    fingerprint_source, read_questions, read_stream, write_stream, CheckpointWriter,
    ParsingStatus, RecoveryInfo, RunMetadata, RunSummary, TestResult,
};

pub use orchestrator::{
    ModelCaller, ModelReply, Placement, RecoveryOutcome, ResultObserver, RunSettings, TestCase,
    TestOrchestrator, TestPlan,
};
