use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use haystack::DepthMode;

use crate::run::{RunInputs, SettingsOverrides};

/// Depth-aware long-context recall tests against an OpenAI-compatible model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML file overlaying the environment configuration
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Test every accepted question and save the results
    Run(RunArgs),
    /// Re-run the failed or missing cases of a prior result stream
    Recover(RecoverArgs),
}

/// Inputs shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Source text the contexts are cut from
    #[arg(long)]
    pub source: PathBuf,

    /// Question set (JSONL, optional metadata header)
    #[arg(long)]
    pub questions: PathBuf,

    /// Result stream to write (JSONL)
    #[arg(long)]
    pub output: PathBuf,

    /// JSON file with `system` and `user` prompt templates
    #[arg(long)]
    pub prompt_template: Option<PathBuf>,

    /// Test questions that carry no validation verdict
    #[arg(long, default_value_t = false)]
    pub skip_validation: bool,

    /// Drop questions validated as invalid instead of rejecting the batch
    #[arg(long, default_value_t = false)]
    pub ignore_invalid: bool,
}

/// Placement and scheduling knobs.
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Depth mode: uniform, fixed or legacy
    #[arg(long)]
    pub mode: Option<DepthMode>,

    /// Context lengths in tokens, comma separated
    #[arg(long, value_delimiter = ',')]
    pub context_lengths: Option<Vec<usize>>,

    /// Target depth in [0, 1] for fixed mode
    #[arg(long)]
    pub fixed_depth: Option<f64>,

    /// Tokens kept around each evidence span
    #[arg(long)]
    pub padding_size: Option<usize>,

    /// Concurrent model calls (overrides DEFAULT_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Test at most this many questions, sampled evenly across source positions
    #[arg(long)]
    pub limit: Option<usize>,

    /// Seed for question sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub inputs: InputArgs,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RecoverArgs {
    /// Prior result stream or checkpoint to resume from
    #[arg(long)]
    pub prior: PathBuf,

    #[command(flatten)]
    pub inputs: InputArgs,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

impl InputArgs {
    pub fn to_inputs(&self) -> RunInputs {
        RunInputs {
            source: self.source.clone(),
            questions: self.questions.clone(),
            output: self.output.clone(),
            prompt_template: self.prompt_template.clone(),
            skip_validation: self.skip_validation,
            ignore_invalid: self.ignore_invalid,
        }
    }
}

impl SettingsArgs {
    /// Overrides from the flags, with `default_concurrency` standing in for
    /// a missing `--concurrency`.
    pub fn to_overrides(&self, default_concurrency: usize) -> SettingsOverrides {
        SettingsOverrides {
            mode: self.mode,
            context_lengths: self.context_lengths.clone(),
            fixed_depth: self.fixed_depth,
            padding_size: self.padding_size,
            concurrency: Some(self.concurrency.unwrap_or(default_concurrency)),
            sample_limit: self.limit,
            sample_seed: self.seed,
        }
    }
}
