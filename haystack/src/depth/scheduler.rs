//! Deterministic (depth × context length) assignment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DepthBin, DepthMode, DEPTH_BIN_COUNT};
use crate::error::{EngineError, EngineResult};

/// One question's grid point for a single scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthAssignment {
    pub question_index: usize,
    pub target_depth: f64,
    pub depth_bin: DepthBin,
    pub context_length: usize,
}

/// Assigns every question one (depth, context length) pair.
///
/// Pure and deterministic: the same question count and configuration always
/// yield the same assignments, which is what lets recovery re-derive a
/// prior run's grid instead of persisting it.
#[derive(Debug, Clone)]
pub struct DepthScheduler {
    mode: DepthMode,
    fixed_depth: Option<f64>,
    context_lengths: Vec<usize>,
}

impl DepthScheduler {
    /// Validate the configuration up front. Fixed mode needs a depth in `[0, 1]`.
    pub fn new(
        mode: DepthMode,
        fixed_depth: Option<f64>,
        context_lengths: Vec<usize>,
    ) -> EngineResult<Self> {
        if mode == DepthMode::Fixed {
            match fixed_depth {
                None => {
                    return Err(EngineError::invalid_schedule(
                        "fixed depth mode requires a fixed depth",
                    ))
                }
                Some(d) if !(0.0..=1.0).contains(&d) => {
                    return Err(EngineError::invalid_schedule(format!(
                        "fixed depth must be within [0, 1], got {d}"
                    )))
                }
                Some(_) => {}
            }
        }
        if context_lengths.iter().any(|&l| l == 0) {
            return Err(EngineError::invalid_schedule(
                "context lengths must be positive",
            ));
        }

        Ok(Self {
            mode,
            fixed_depth,
            context_lengths,
        })
    }

    pub fn mode(&self) -> DepthMode {
        self.mode
    }

    pub fn context_lengths(&self) -> &[usize] {
        &self.context_lengths
    }

    /// Assign `question_count` questions, one assignment per index, in index order.
    pub fn schedule(&self, question_count: usize) -> EngineResult<Vec<DepthAssignment>> {
        if self.context_lengths.is_empty() {
            return Err(EngineError::invalid_schedule(
                "at least one context length is required",
            ));
        }

        let assignments = match self.mode {
            DepthMode::Uniform => self.schedule_uniform(question_count),
            DepthMode::Fixed => self.schedule_fixed(question_count)?,
            DepthMode::Legacy => {
                return Err(EngineError::invalid_schedule(
                    "legacy mode has no depth schedule",
                ))
            }
        };

        log_distribution(&assignments);
        Ok(assignments)
    }

    fn schedule_uniform(&self, question_count: usize) -> Vec<DepthAssignment> {
        let lengths = self.context_lengths.len();
        let combos = DEPTH_BIN_COUNT * lengths;

        (0..question_count)
            .map(|i| {
                let combo = i % combos;
                let bin = DepthBin::ALL[combo % DEPTH_BIN_COUNT];
                DepthAssignment {
                    question_index: i,
                    target_depth: bin.value(),
                    depth_bin: bin,
                    context_length: self.context_lengths[combo / DEPTH_BIN_COUNT],
                }
            })
            .collect()
    }

    fn schedule_fixed(&self, question_count: usize) -> EngineResult<Vec<DepthAssignment>> {
        let depth = self.fixed_depth.ok_or_else(|| {
            EngineError::invalid_schedule("fixed depth mode requires a fixed depth")
        })?;
        let bin = DepthBin::nearest(depth);
        if DepthBin::exact(depth).is_none() {
            debug!(depth, bin = %bin, "fixed depth rounded to nearest bin label");
        }

        let lengths = &self.context_lengths;
        Ok((0..question_count)
            .map(|i| DepthAssignment {
                question_index: i,
                target_depth: depth,
                depth_bin: bin,
                context_length: lengths[i % lengths.len()],
            })
            .collect())
    }
}

fn log_distribution(assignments: &[DepthAssignment]) {
    let mut per_cell: BTreeMap<(usize, DepthBin), usize> = BTreeMap::new();
    for a in assignments {
        *per_cell.entry((a.context_length, a.depth_bin)).or_default() += 1;
    }
    info!(
        assignments = assignments.len(),
        cells = per_cell.len(),
        "depth schedule built"
    );
    for ((length, bin), count) in per_cell {
        debug!(context_length = length, depth_bin = %bin, count, "schedule cell");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn uniform_sweeps_depths_before_lengths() {
        let s = DepthScheduler::new(DepthMode::Uniform, None, vec![1000, 2000]).unwrap();
        let a = s.schedule(12).unwrap();

        assert_eq!(a.len(), 12);
        assert_eq!(a[0].depth_bin, DepthBin::D0);
        assert_eq!(a[4].depth_bin, DepthBin::D100);
        assert_eq!(a[4].context_length, 1000);
        assert_eq!(a[5].depth_bin, DepthBin::D0);
        assert_eq!(a[5].context_length, 2000);
        assert_eq!(a[10].depth_bin, DepthBin::D0);
        assert_eq!(a[10].context_length, 1000);
        for (i, assignment) in a.iter().enumerate() {
            assert_eq!(assignment.question_index, i);
        }
    }

    #[test]
    fn uniform_grid_is_balanced_for_any_batch_size() {
        let s = DepthScheduler::new(DepthMode::Uniform, None, vec![500, 1000, 4000]).unwrap();
        for q in [0usize, 1, 14, 15, 16, 47, 100] {
            let a = s.schedule(q).unwrap();
            let mut counts: HashMap<(usize, DepthBin), usize> = HashMap::new();
            for x in &a {
                *counts.entry((x.context_length, x.depth_bin)).or_default() += 1;
            }
            let lo = q / 15;
            let hi = q.div_ceil(15);
            for length in [500, 1000, 4000] {
                for bin in DepthBin::ALL {
                    let c = counts.get(&(length, bin)).copied().unwrap_or(0);
                    assert!(c == lo || c == hi, "q={q} cell=({length},{bin}) count={c}");
                }
            }
        }
    }

    #[test]
    fn schedule_is_deterministic() {
        let s = DepthScheduler::new(DepthMode::Uniform, None, vec![1000, 3000]).unwrap();
        assert_eq!(s.schedule(37).unwrap(), s.schedule(37).unwrap());
    }

    #[test]
    fn fixed_mode_cycles_lengths_and_rounds_label() {
        let s = DepthScheduler::new(DepthMode::Fixed, Some(0.4), vec![1000, 2000, 3000]).unwrap();
        let a = s.schedule(7).unwrap();

        let lengths: Vec<usize> = a.iter().map(|x| x.context_length).collect();
        assert_eq!(lengths, vec![1000, 2000, 3000, 1000, 2000, 3000, 1000]);
        assert!(a.iter().all(|x| x.target_depth == 0.4));
        assert!(a.iter().all(|x| x.depth_bin == DepthBin::D50));
    }

    #[test]
    fn fixed_mode_requires_depth_in_range() {
        assert!(DepthScheduler::new(DepthMode::Fixed, None, vec![1000]).is_err());
        assert!(DepthScheduler::new(DepthMode::Fixed, Some(1.5), vec![1000]).is_err());
        assert!(DepthScheduler::new(DepthMode::Fixed, Some(-0.1), vec![1000]).is_err());
        assert!(DepthScheduler::new(DepthMode::Fixed, Some(1.0), vec![1000]).is_ok());
    }

    #[test]
    fn empty_lengths_fail_at_schedule_time() {
        let s = DepthScheduler::new(DepthMode::Uniform, None, vec![]).unwrap();
        let err = s.schedule(3).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchedule { .. }));
    }

    #[test]
    fn legacy_mode_is_not_scheduled() {
        let s = DepthScheduler::new(DepthMode::Legacy, None, vec![1000]).unwrap();
        assert!(s.schedule(3).is_err());
    }
}
