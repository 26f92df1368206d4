//! Depth-balanced pre-sampling of a question set.
//!
//! Only decides which questions enter the scheduler. Randomized, but driven
//! by an explicit seed so a capped run can be reproduced.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use super::DEPTH_BIN_COUNT;
use crate::question::Question;

/// Pick up to `limit` question indices spread evenly over the source.
///
/// Questions are partitioned into five equal-width bins by
/// `end_pos / source_len`. Each bin gets `limit / 5` draws (the first
/// `limit % 5` bins one more); a bin that cannot meet its quota hands the
/// shortfall to a random draw from everything left over. The returned
/// indices are sorted so the scheduler sees the original question order.
pub fn balanced_sample(
    questions: &[Question],
    source_len: usize,
    limit: usize,
    seed: u64,
) -> Vec<usize> {
    if limit >= questions.len() {
        return (0..questions.len()).collect();
    }

    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); DEPTH_BIN_COUNT];
    for (idx, q) in questions.iter().enumerate() {
        bins[position_bin(q.position.end_pos, source_len)].push(idx);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let base = limit / DEPTH_BIN_COUNT;
    let extra = limit % DEPTH_BIN_COUNT;

    let mut picked = Vec::with_capacity(limit);
    let mut leftover = Vec::new();
    for (bin_idx, bin) in bins.iter_mut().enumerate() {
        let quota = base + usize::from(bin_idx < extra);
        bin.shuffle(&mut rng);
        let take = quota.min(bin.len());
        if take < quota {
            debug!(bin = bin_idx, quota, available = bin.len(), "depth bin short of quota");
        }
        picked.extend_from_slice(&bin[..take]);
        leftover.extend_from_slice(&bin[take..]);
    }

    let shortfall = limit - picked.len();
    if shortfall > 0 {
        leftover.shuffle(&mut rng);
        picked.extend(leftover.into_iter().take(shortfall));
    }

    picked.sort_unstable();
    info!(
        requested = limit,
        sampled = picked.len(),
        pool = questions.len(),
        seed,
        "balanced sample drawn"
    );
    picked
}

fn position_bin(end_pos: usize, source_len: usize) -> usize {
    if source_len == 0 {
        return 0;
    }
    let ratio = end_pos as f64 / source_len as f64;
    ((ratio * DEPTH_BIN_COUNT as f64) as usize).min(DEPTH_BIN_COUNT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::fixtures::question;

    fn spread(ends: &[usize]) -> Vec<Question> {
        ends.iter().map(|&e| question(e.saturating_sub(5), e)).collect()
    }

    #[test]
    fn limit_above_pool_returns_everything() {
        let qs = spread(&[10, 20, 30]);
        assert_eq!(balanced_sample(&qs, 100, 10, 7), vec![0, 1, 2]);
    }

    #[test]
    fn draws_evenly_across_bins() {
        // 4 questions per fifth of a 1000-token source.
        let ends: Vec<usize> = (0..20).map(|i| 50 * i + 25).collect();
        let qs = spread(&ends);
        let picked = balanced_sample(&qs, 1000, 10, 42);

        assert_eq!(picked.len(), 10);
        let mut per_bin = [0usize; DEPTH_BIN_COUNT];
        for &i in &picked {
            per_bin[position_bin(qs[i].position.end_pos, 1000)] += 1;
        }
        assert_eq!(per_bin, [2, 2, 2, 2, 2]);
    }

    #[test]
    fn short_bins_are_backfilled_from_the_pool() {
        // Everything sits in the first fifth except one question at the end.
        let mut ends: Vec<usize> = (1..=12).map(|i| i * 10).collect();
        ends.push(990);
        let qs = spread(&ends);
        let picked = balanced_sample(&qs, 1000, 6, 3);

        assert_eq!(picked.len(), 6);
        assert!(picked.contains(&12), "only late question must be picked");
        let mut dedup = picked.clone();
        dedup.dedup();
        assert_eq!(dedup, picked);
    }

    #[test]
    fn same_seed_same_sample() {
        let ends: Vec<usize> = (0..40).map(|i| 20 * i + 7).collect();
        let qs = spread(&ends);
        assert_eq!(
            balanced_sample(&qs, 800, 9, 11),
            balanced_sample(&qs, 800, 9, 11)
        );
    }

    #[test]
    fn end_of_source_lands_in_last_bin() {
        assert_eq!(position_bin(1000, 1000), 4);
        assert_eq!(position_bin(0, 1000), 0);
        assert_eq!(position_bin(5, 0), 0);
    }
}
