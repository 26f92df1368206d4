//! Run and recovery drivers
//!
//! Both drivers follow the same pipeline:
//!
//! ```text
//! source text ─ tokenizer ─► ContextBuilder
//! question set ─ QuestionGate ─► TestPlan
//! TestOrchestrator (checkpoint observer) ─► ordered results ─► output stream
//! ```
//!
//! Results are appended to `<output>.partial` as they complete; the final,
//! plan-ordered stream replaces it on success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use haystack::orchestrator::DEFAULT_CONCURRENCY;
use haystack::{
    fingerprint_source, read_questions, read_stream, write_stream, CheckpointWriter,
    ContextBuilder, DepthMode, EngineError, ModelCaller, PromptTemplate, Question, QuestionGate,
    RecoveryInfo, ResultObserver, RunMetadata, RunSettings, RunSummary, TestOrchestrator,
    TestPlan, TestResult, Tokenizer,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Model-side dependencies of a run.
#[derive(Clone)]
pub struct Engine {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub caller: Arc<dyn ModelCaller>,
    pub model_name: String,
    /// Redacted client configuration recorded in the run metadata.
    pub config: serde_json::Value,
}

/// Files and gate switches shared by `run` and `recover`.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub source: PathBuf,
    pub questions: PathBuf,
    pub output: PathBuf,
    pub prompt_template: Option<PathBuf>,
    pub skip_validation: bool,
    pub ignore_invalid: bool,
}

/// Per-field overrides on top of a base [`RunSettings`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOverrides {
    pub mode: Option<DepthMode>,
    pub context_lengths: Option<Vec<usize>>,
    pub fixed_depth: Option<f64>,
    pub padding_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub sample_limit: Option<usize>,
    pub sample_seed: Option<u64>,
}

impl SettingsOverrides {
    pub fn apply(&self, mut base: RunSettings) -> RunSettings {
        if let Some(mode) = self.mode {
            base.mode = mode;
        }
        if let Some(lengths) = &self.context_lengths {
            base.context_lengths = lengths.clone();
        }
        if self.fixed_depth.is_some() {
            base.fixed_depth = self.fixed_depth;
        }
        if let Some(padding) = self.padding_size {
            base.padding_size = padding;
        }
        if let Some(concurrency) = self.concurrency {
            base.concurrency = concurrency;
        }
        if self.sample_limit.is_some() {
            base.sample_limit = self.sample_limit;
        }
        if let Some(seed) = self.sample_seed {
            base.sample_seed = seed;
        }
        base
    }
}

/// What a finished run or recovery produced.
#[derive(Debug)]
pub struct RunReport {
    pub output: PathBuf,
    pub metadata: RunMetadata,
    pub results: Vec<TestResult>,
    pub summary: RunSummary,
}

struct Prepared {
    builder: ContextBuilder,
    fingerprint: String,
    questions: Arc<[Question]>,
    question_set_metadata: Option<serde_json::Value>,
    accepted: Vec<usize>,
    prompts: PromptTemplate,
}

fn prepare(engine: &Engine, inputs: &RunInputs) -> Result<Prepared> {
    let text = std::fs::read_to_string(&inputs.source)
        .with_context(|| format!("Failed to read source text {}", inputs.source.display()))?;
    if text.trim().is_empty() {
        bail!("source text {} is empty", inputs.source.display());
    }
    let fingerprint = fingerprint_source(&text);
    let tokens = engine.tokenizer.encode(&text);
    info!(
        path = %inputs.source.display(),
        chars = text.chars().count(),
        tokens = tokens.len(),
        "source text loaded"
    );
    let builder = ContextBuilder::new(engine.tokenizer.clone(), tokens.into());

    let (question_set_metadata, questions) = read_questions(&inputs.questions)
        .with_context(|| format!("Failed to read question set {}", inputs.questions.display()))?;
    info!(count = questions.len(), "questions loaded");

    let (accepted, _) =
        QuestionGate::check_indices(&questions, inputs.skip_validation, inputs.ignore_invalid)?;

    let prompts = match &inputs.prompt_template {
        Some(path) => PromptTemplate::from_file(path)
            .with_context(|| format!("Failed to load prompt template {}", path.display()))?,
        None => PromptTemplate::default(),
    };

    Ok(Prepared {
        builder,
        fingerprint,
        questions: questions.into(),
        question_set_metadata,
        accepted,
        prompts,
    })
}

fn metadata_for(
    engine: &Engine,
    inputs: &RunInputs,
    prepared: &Prepared,
    settings: &RunSettings,
    plan: &TestPlan,
) -> RunMetadata {
    RunMetadata {
        run_id: Uuid::new_v4(),
        tested_at: Utc::now(),
        model_name: engine.model_name.clone(),
        source_path: inputs.source.display().to_string(),
        source_fingerprint: prepared.fingerprint.clone(),
        source_tokens: prepared.builder.source_len(),
        question_set_path: inputs.questions.display().to_string(),
        depth_mode: settings.mode,
        context_lengths: settings.context_lengths.clone(),
        fixed_depth: settings.fixed_depth,
        padding_size: settings.padding_size,
        total_questions: prepared.questions.len(),
        tested_questions: plan.question_count(),
        sample_limit: settings.sample_limit,
        sample_seed: settings.sample_seed,
        config: engine.config.clone(),
        question_set_metadata: prepared.question_set_metadata.clone(),
        recovery: None,
    }
}

/// Write the final stream, then drop the checkpoint it supersedes.
fn finalize(
    output: &Path,
    metadata: RunMetadata,
    results: Vec<TestResult>,
    checkpoint: Arc<CheckpointWriter>,
) -> Result<RunReport> {
    write_stream(output, &metadata, &results)
        .with_context(|| format!("Failed to write results to {}", output.display()))?;
    match Arc::try_unwrap(checkpoint) {
        Ok(writer) => writer.finish().context("Failed to remove checkpoint")?,
        Err(writer) => warn!(
            path = %writer.path().display(),
            "checkpoint still shared; left in place"
        ),
    }

    let summary = RunSummary::from_results(&results);
    summary.log();
    info!(path = %output.display(), records = results.len(), "results saved");
    Ok(RunReport {
        output: output.to_path_buf(),
        metadata,
        results,
        summary,
    })
}

/// Gate, plan, run every case, and save the ordered results.
pub async fn run_tests(
    engine: &Engine,
    inputs: &RunInputs,
    settings: &RunSettings,
) -> Result<RunReport> {
    let prepared = prepare(engine, inputs)?;
    let plan = TestPlan::build_for(
        &prepared.questions,
        &prepared.accepted,
        prepared.builder.source_len(),
        settings,
    )?;
    let metadata = metadata_for(engine, inputs, &prepared, settings, &plan);
    info!(
        run_id = %metadata.run_id,
        model = %metadata.model_name,
        cases = plan.len(),
        "starting test run"
    );

    let checkpoint = Arc::new(CheckpointWriter::create(
        CheckpointWriter::path_for(&inputs.output),
        &metadata,
    )?);
    let results = {
        let orchestrator = TestOrchestrator::new(prepared.builder, prepared.prompts)
            .with_concurrency(settings.concurrency)
            .with_observer(checkpoint.clone());
        orchestrator
            .run(prepared.questions, &plan, engine.caller.clone())
            .await?
    };

    finalize(&inputs.output, metadata, results, checkpoint)
}

/// Re-run the failed and missing cases of the stream at `prior`.
///
/// Settings come from the prior run's metadata, then `overrides`. A prior run
/// over a different source text is refused.
pub async fn recover_tests(
    engine: &Engine,
    prior: &Path,
    inputs: &RunInputs,
    overrides: &SettingsOverrides,
) -> Result<RunReport> {
    let (prior_metadata, prior_results) = read_stream(prior)
        .with_context(|| format!("Failed to read prior results {}", prior.display()))?;
    info!(path = %prior.display(), records = prior_results.len(), "prior results loaded");

    let base = match &prior_metadata {
        Some(m) => RunSettings {
            mode: m.depth_mode,
            context_lengths: m.context_lengths.clone(),
            fixed_depth: m.fixed_depth,
            padding_size: m.padding_size,
            concurrency: DEFAULT_CONCURRENCY,
            sample_limit: m.sample_limit,
            sample_seed: m.sample_seed,
        },
        None => {
            warn!("prior stream has no run metadata; settings come from the command line only");
            RunSettings::default()
        }
    };
    let settings = overrides.apply(base);

    let prepared = prepare(engine, inputs)?;
    if let Some(m) = &prior_metadata {
        if m.source_fingerprint != prepared.fingerprint {
            bail!(
                "source text {} differs from the one used by the prior run ({}); \
                 refusing to recover",
                inputs.source.display(),
                m.source_path
            );
        }
    }

    let plan = TestPlan::build_for(
        &prepared.questions,
        &prepared.accepted,
        prepared.builder.source_len(),
        &settings,
    )?;
    let mut metadata = metadata_for(engine, inputs, &prepared, &settings, &plan);
    info!(run_id = %metadata.run_id, cases = plan.len(), "starting recovery");

    // Seed the checkpoint with the prior history so an interrupted recovery
    // can itself be recovered without losing the kept records.
    let checkpoint = Arc::new(CheckpointWriter::create(
        CheckpointWriter::path_for(&inputs.output),
        &metadata,
    )?);
    for (index, record) in prior_results.iter().enumerate() {
        checkpoint.on_result(index, record);
    }

    let outcome = {
        let orchestrator = TestOrchestrator::new(prepared.builder, prepared.prompts)
            .with_concurrency(settings.concurrency)
            .with_observer(checkpoint.clone());
        orchestrator
            .run_recovery(prior_results, prepared.questions, &plan, engine.caller.clone())
            .await?
    };

    metadata.recovery = Some(RecoveryInfo {
        recovered_at: Utc::now(),
        prior_path: prior.display().to_string(),
        kept: outcome.kept,
        retried: outcome.retried,
        discarded: outcome.discarded,
    });
    info!(
        kept = outcome.kept,
        retried = outcome.retried,
        discarded = outcome.discarded,
        "recovery finished"
    );

    finalize(&inputs.output, metadata, outcome.results, checkpoint)
}

/// Settings for a fresh run: library defaults plus `overrides`.
pub fn fresh_settings(overrides: &SettingsOverrides) -> Result<RunSettings> {
    let settings = overrides.apply(RunSettings::default());
    if settings.context_lengths.is_empty() {
        return Err(anyhow!("--context-lengths is required for a new run"));
    }
    Ok(settings)
}

/// Process exit status for a failed run: 2 when the inputs were rejected
/// before any model call, 1 for everything else.
pub fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<EngineError>() {
        Some(e) if e.is_configuration_error() => 2,
        _ => 1,
    }
}
