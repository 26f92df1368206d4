//! haystack-bench: depth-aware long-context recall tests
//!
//! # Usage
//!
//! ```bash
//! # Full depth × length grid
//! OPENAI_API_KEY=... MODEL_NAME=... haystack-bench run \
//!     --source data/novel.txt --questions data/questions.jsonl \
//!     --output data/results.jsonl --context-lengths 8000,32000
//!
//! # Resume the failures of an earlier run (or its .partial checkpoint)
//! haystack-bench recover --prior data/results.jsonl.partial \
//!     --source data/novel.txt --questions data/questions.jsonl \
//!     --output data/results.jsonl
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use haystack_bench::cli::{Cli, Command};
use haystack_bench::run::{exit_status, fresh_settings};
use haystack_bench::{
    recover_tests, run_tests, BenchConfig, Engine, OpenAiCaller, TiktokenTokenizer,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let status = exit_status(&e);
            if status == 2 {
                error!("run rejected before any model call: {e:#}");
            } else {
                error!("{e:#}");
            }
            ExitCode::from(status)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = BenchConfig::from_env()?;
    if let Some(path) = &cli.config {
        config = config.merge_file(path)?;
    }
    config.validate()?;

    let caller = OpenAiCaller::from_config(&config)?;
    let engine = Engine {
        tokenizer: Arc::new(TiktokenTokenizer::cl100k()?),
        caller: Arc::new(caller),
        model_name: config.model_name.clone(),
        config: config.redacted(),
    };
    info!(
        model = %config.model_name,
        endpoint = %config.chat_completions_url(),
        "haystack-bench starting"
    );

    let report = match cli.command {
        Command::Run(args) => {
            let settings = fresh_settings(&args.settings.to_overrides(config.concurrency))?;
            run_tests(&engine, &args.inputs.to_inputs(), &settings).await?
        }
        Command::Recover(args) => {
            let overrides = args.settings.to_overrides(config.concurrency);
            recover_tests(&engine, &args.prior, &args.inputs.to_inputs(), &overrides).await?
        }
    };

    info!(
        output = %report.output.display(),
        total = report.summary.total,
        mean_score = report.summary.mean_score,
        "done"
    );
    Ok(())
}
