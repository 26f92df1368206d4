//! Run settings, the feasibility pre-check, and the resulting test plan.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::depth::{balanced_sample, DepthBin, DepthMode, DepthScheduler};
use crate::error::{EngineError, EngineResult};
use crate::question::Question;

/// Default evidence padding, in tokens.
pub const DEFAULT_PADDING_SIZE: usize = 500;
/// Default number of in-flight model calls.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Knobs that decide which cases a run contains and how they execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub mode: DepthMode,
    pub context_lengths: Vec<usize>,
    pub fixed_depth: Option<f64>,
    pub padding_size: usize,
    pub concurrency: usize,
    /// Cap on tested questions, drawn with [`balanced_sample`].
    pub sample_limit: Option<usize>,
    pub sample_seed: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: DepthMode::Uniform,
            context_lengths: Vec::new(),
            fixed_depth: None,
            padding_size: DEFAULT_PADDING_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            sample_limit: None,
            sample_seed: 0,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.context_lengths.is_empty() {
            return Err(EngineError::invalid_schedule(
                "at least one context length is required",
            ));
        }
        if self.concurrency == 0 {
            return Err(EngineError::invalid_schedule("concurrency must be at least 1"));
        }
        if self.mode == DepthMode::Legacy && self.context_lengths.len() != 1 {
            return Err(EngineError::invalid_schedule(format!(
                "legacy mode takes exactly one context length, got {}",
                self.context_lengths.len()
            )));
        }
        if self.sample_limit == Some(0) {
            return Err(EngineError::invalid_schedule("sample limit must be positive"));
        }
        Ok(())
    }
}

/// Where one question's evidence goes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// Evidence window spliced into filler at a target depth.
    Depth {
        target_depth: f64,
        depth_bin: DepthBin,
        context_length: usize,
    },
    /// The first `context_length` source tokens, shared by every case.
    Prefix { context_length: usize },
}

impl Placement {
    pub fn context_length(&self) -> usize {
        match *self {
            Self::Depth { context_length, .. } | Self::Prefix { context_length } => context_length,
        }
    }

    pub fn depth_bin(&self) -> Option<DepthBin> {
        match *self {
            Self::Depth { depth_bin, .. } => Some(depth_bin),
            Self::Prefix { .. } => None,
        }
    }
}

/// One scheduled assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Index into the question set the plan was built from.
    pub question_index: usize,
    pub placement: Placement,
}

/// Identity of a case across runs: the recovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CaseKey {
    pub question_index: usize,
    pub cell: Option<(DepthBin, usize)>,
}

impl TestCase {
    pub(crate) fn key(&self) -> CaseKey {
        CaseKey {
            question_index: self.question_index,
            cell: match self.placement {
                Placement::Depth {
                    depth_bin,
                    context_length,
                    ..
                } => Some((depth_bin, context_length)),
                Placement::Prefix { .. } => None,
            },
        }
    }
}

/// Ordered list of cases for a run. Built once; both a fresh run and a
/// recovery execute against it.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    mode: DepthMode,
    padding_size: usize,
    cases: Vec<TestCase>,
}

impl TestPlan {
    /// Plan over every question in `questions`.
    pub fn build(
        questions: &[Question],
        source_len: usize,
        settings: &RunSettings,
    ) -> EngineResult<Self> {
        let all: Vec<usize> = (0..questions.len()).collect();
        Self::build_for(questions, &all, source_len, settings)
    }

    /// Plan over the questions at `selected` (e.g. those accepted by the gate).
    /// Case indices keep referring to positions in `questions`.
    pub fn build_for(
        questions: &[Question],
        selected: &[usize],
        source_len: usize,
        settings: &RunSettings,
    ) -> EngineResult<Self> {
        settings.validate()?;
        if let Some(&bad) = selected.iter().find(|&&i| i >= questions.len()) {
            return Err(EngineError::invalid_schedule(format!(
                "selected question {bad} is outside the question set ({} questions)",
                questions.len()
            )));
        }
        if selected.is_empty() {
            return Err(EngineError::batch_rejected("no questions to test", Vec::new()));
        }
        for &i in selected {
            questions[i].check_shape(i)?;
        }

        let cases = if settings.mode.is_depth_aware() {
            depth_cases(questions, selected, source_len, settings)?
        } else {
            legacy_cases(questions, selected, source_len, settings)?
        };

        info!(
            mode = %settings.mode,
            cases = cases.len(),
            lengths = ?settings.context_lengths,
            padding = settings.padding_size,
            "test plan built"
        );
        Ok(Self {
            mode: settings.mode,
            padding_size: settings.padding_size,
            cases,
        })
    }

    pub fn mode(&self) -> DepthMode {
        self.mode
    }

    pub fn padding_size(&self) -> usize {
        self.padding_size
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Distinct questions covered by the plan.
    pub fn question_count(&self) -> usize {
        self.cases
            .iter()
            .map(|c| c.question_index)
            .collect::<HashSet<_>>()
            .len()
    }

    pub(crate) fn check_against(&self, question_count: usize) -> EngineResult<()> {
        match self.cases.iter().find(|c| c.question_index >= question_count) {
            Some(c) => Err(EngineError::invalid_schedule(format!(
                "plan references question {} but only {question_count} were supplied",
                c.question_index
            ))),
            None => Ok(()),
        }
    }
}

fn sample(
    questions: &[Question],
    selected: Vec<usize>,
    source_len: usize,
    settings: &RunSettings,
) -> Vec<usize> {
    match settings.sample_limit {
        Some(limit) if limit < selected.len() => {
            let pool: Vec<Question> = selected.iter().map(|&i| questions[i].clone()).collect();
            balanced_sample(&pool, source_len, limit, settings.sample_seed)
                .into_iter()
                .map(|p| selected[p])
                .collect()
        }
        _ => selected,
    }
}

fn legacy_cases(
    questions: &[Question],
    selected: &[usize],
    source_len: usize,
    settings: &RunSettings,
) -> EngineResult<Vec<TestCase>> {
    let context_length = settings.context_lengths[0];
    if context_length > source_len {
        return Err(EngineError::infeasible(format!(
            "context length {context_length} exceeds the source ({source_len} tokens)"
        )));
    }

    let fitting: Vec<usize> = selected
        .iter()
        .copied()
        .filter(|&i| {
            let end = questions[i].position.end_pos;
            let fits = end + settings.padding_size <= context_length;
            if !fits {
                debug!(
                    question = i,
                    end_pos = end,
                    required = end + settings.padding_size,
                    context_length,
                    "question does not fit the prefix context"
                );
            }
            fits
        })
        .collect();
    info!(
        kept = fitting.len(),
        removed = selected.len() - fitting.len(),
        "filtered questions against prefix context"
    );
    if fitting.is_empty() {
        return Err(EngineError::batch_rejected(
            format!(
                "no question fits a {context_length}-token prefix with {} tokens of padding",
                settings.padding_size
            ),
            Vec::new(),
        ));
    }

    Ok(sample(questions, fitting, source_len, settings)
        .into_iter()
        .map(|question_index| TestCase {
            question_index,
            placement: Placement::Prefix { context_length },
        })
        .collect())
}

fn depth_cases(
    questions: &[Question],
    selected: &[usize],
    source_len: usize,
    settings: &RunSettings,
) -> EngineResult<Vec<TestCase>> {
    let chosen = sample(questions, selected.to_vec(), source_len, settings);
    check_feasibility(questions, &chosen, source_len, settings)?;

    let scheduler = DepthScheduler::new(
        settings.mode,
        settings.fixed_depth,
        settings.context_lengths.clone(),
    )?;
    Ok(scheduler
        .schedule(chosen.len())?
        .into_iter()
        .map(|a| TestCase {
            question_index: chosen[a.question_index],
            placement: Placement::Depth {
                target_depth: a.target_depth,
                depth_bin: a.depth_bin,
                context_length: a.context_length,
            },
        })
        .collect())
}

/// Reject configurations that could only produce context-build failures.
fn check_feasibility(
    questions: &[Question],
    chosen: &[usize],
    source_len: usize,
    settings: &RunSettings,
) -> EngineResult<()> {
    let lengths = &settings.context_lengths;
    let (Some(&min_len), Some(&max_len)) = (lengths.iter().min(), lengths.iter().max()) else {
        return Err(EngineError::invalid_schedule(
            "at least one context length is required",
        ));
    };

    if max_len > source_len {
        return Err(EngineError::infeasible(format!(
            "maximum context length {max_len} exceeds the source ({source_len} tokens)"
        )));
    }

    let window = |i: usize| {
        let (start, end) = questions[i]
            .position
            .padded_window(settings.padding_size, source_len);
        end - start
    };

    if let Some(&earliest) = chosen
        .iter()
        .min_by_key(|&&i| (questions[i].position.start_pos, i))
    {
        let w = window(earliest);
        if min_len <= w {
            return Err(EngineError::infeasible(format!(
                "minimum context length {min_len} cannot hold the earliest evidence window \
                 ({w} tokens for question {earliest} with padding {})",
                settings.padding_size
            )));
        }
    }

    let outside = chosen
        .iter()
        .filter(|&&i| questions[i].position.start_pos >= source_len)
        .count();
    let satisfiable = chosen
        .iter()
        .any(|&i| questions[i].position.start_pos < source_len && window(i) < max_len);
    if !satisfiable {
        return Err(EngineError::infeasible(format!(
            "no (context length, question) pair can be built: {outside} of {} questions \
             start beyond the source ({source_len} tokens), the rest need more than \
             {max_len} tokens",
            chosen.len()
        )));
    }
    if outside > 0 {
        warn!(
            outside,
            source_len,
            "some questions start beyond the source and will fail to build"
        );
    }
    Ok(())
}
