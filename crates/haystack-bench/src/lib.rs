//! Command-line bench for the `haystack` recall engine
//!
//! Wires the engine's seams to real services:
//! - [`OpenAiCaller`]: OpenAI-compatible chat completions with retry/backoff
//! - [`TiktokenTokenizer`]: `cl100k_base` BPE tokenization
//! - [`run_tests`] / [`recover_tests`]: end-to-end drivers with checkpointing

pub mod cli;
pub mod config;
pub mod llm;
pub mod run;
pub mod tokenizer;

pub use config::BenchConfig;
pub use llm::{OpenAiCaller, RetryPolicy};
pub use run::{recover_tests, run_tests, Engine, RunInputs, RunReport, SettingsOverrides};
pub use tokenizer::TiktokenTokenizer;
