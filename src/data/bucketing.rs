// ============================================================
// Layer 4 — Dynamic Batching
// ============================================================
// Groups utterances of similar duration into batches whose size
// follows the audio length instead of a fixed count:
//
//   1. sort utterances by duration
//   2. cut the sorted list into `num_buckets` buckets of about
//      the same number of utterances
//   3. optionally shuffle each bucket (`shuffle_ex`)
//   4. walk each bucket and close the batch as soon as
//        longest duration × (utterances + 1) > max_batch_len
//      An utterance longer than max_batch_len gets a batch of
//      its own.
//   5. order the batches (`batch_ordering`)
//
// With `batch_ordering = random` the order is left to the data
// loader, which reshuffles the batches every epoch from a seed.
//
// Reference: Rust Book §8 (Vectors)
//            rand crate documentation

use anyhow::{bail, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOrdering {
    #[default]
    Random,
    Ascending,
    Descending,
}

impl BatchOrdering {
    pub fn shuffles(self) -> bool {
        matches!(self, Self::Random)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicBatching {
    /// Padded seconds allowed per batch
    pub max_batch_len:  f64,
    pub num_buckets:    usize,
    pub shuffle_ex:     bool,
    pub batch_ordering: BatchOrdering,
}

impl Default for DynamicBatching {
    fn default() -> Self {
        Self {
            max_batch_len:  120.0,
            num_buckets:    10,
            shuffle_ex:     false,
            batch_ordering: BatchOrdering::Random,
        }
    }
}

impl DynamicBatching {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_batch_len.is_finite() && self.max_batch_len > 0.0) {
            bail!("max_batch_len must be positive, got {}", self.max_batch_len);
        }
        if self.num_buckets == 0 {
            bail!("num_buckets must be >= 1");
        }
        Ok(())
    }

    /// Split utterance indices into batches, given each
    /// utterance's duration in seconds.
    pub fn plan(&self, lengths: &[f64], seed: u64) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..lengths.len()).collect();
        order.sort_by(|&a, &b| lengths[a].total_cmp(&lengths[b]));

        let per_bucket = lengths.len().div_ceil(self.num_buckets).max(1);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut batches: Vec<Vec<usize>> = Vec::new();
        for bucket in order.chunks_mut(per_bucket) {
            if self.shuffle_ex {
                bucket.shuffle(&mut rng);
            }

            let mut current: Vec<usize> = Vec::new();
            let mut longest = 0.0f64;
            for &idx in bucket.iter() {
                let grown = longest.max(lengths[idx]);
                if !current.is_empty() && grown * (current.len() + 1) as f64 > self.max_batch_len {
                    batches.push(std::mem::take(&mut current));
                    longest = lengths[idx];
                } else {
                    longest = grown;
                }
                current.push(idx);
            }
            if !current.is_empty() {
                batches.push(current);
            }
        }

        let longest = |b: &Vec<usize>| b.iter().map(|&i| lengths[i]).fold(0.0f64, f64::max);
        match self.batch_ordering {
            BatchOrdering::Random     => {}
            BatchOrdering::Ascending  => batches.sort_by(|a, b| longest(a).total_cmp(&longest(b))),
            BatchOrdering::Descending => batches.sort_by(|a, b| longest(b).total_cmp(&longest(a))),
        }

        tracing::debug!(
            utterances = lengths.len(),
            batches = batches.len(),
            "Planned dynamic batches"
        );
        batches
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_batch_len: f64, num_buckets: usize, ordering: BatchOrdering) -> DynamicBatching {
        DynamicBatching { max_batch_len, num_buckets, shuffle_ex: false, batch_ordering: ordering }
    }

    #[test]
    fn test_batches_respect_padded_budget() {
        let lengths = [1.0, 2.0, 1.5, 4.0, 0.5, 3.0, 2.5];
        let plan = config(6.0, 1, BatchOrdering::Ascending).plan(&lengths, 0);

        for batch in &plan {
            let longest = batch.iter().map(|&i| lengths[i]).fold(0.0, f64::max);
            assert!(longest * batch.len() as f64 <= 6.0);
        }
        // every utterance exactly once
        let mut seen: Vec<usize> = plan.concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..lengths.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_short_utterances_share_a_batch() {
        // sorted: 0.5 1.0 1.5 | 2.0 2.5 | 3.0 | 4.0
        let lengths = [1.0, 2.0, 1.5, 4.0, 0.5, 3.0, 2.5];
        let plan = config(5.0, 1, BatchOrdering::Ascending).plan(&lengths, 0);
        assert_eq!(plan, vec![vec![4, 0, 2], vec![1, 6], vec![5], vec![3]]);
    }

    #[test]
    fn test_overlong_utterance_gets_own_batch() {
        let plan = config(2.0, 1, BatchOrdering::Ascending).plan(&[1.0, 9.0], 0);
        assert_eq!(plan, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_buckets_never_mix() {
        // two buckets: {0.1, 0.2} and {5.0, 5.1}; a budget of 100 s
        // would fit everything in one batch without bucketing
        let lengths = [5.0, 0.1, 5.1, 0.2];
        let plan = config(100.0, 2, BatchOrdering::Ascending).plan(&lengths, 0);
        assert_eq!(plan, vec![vec![1, 3], vec![0, 2]]);
    }

    #[test]
    fn test_descending_ordering() {
        let lengths = [1.0, 2.0, 3.0];
        let plan = config(1.0, 1, BatchOrdering::Descending).plan(&lengths, 0);
        assert_eq!(plan, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn test_shuffle_ex_is_seeded() {
        let lengths: Vec<f64> = (0..40).map(|i| 1.0 + (i % 7) as f64 * 0.1).collect();
        let cfg = DynamicBatching { shuffle_ex: true, ..config(8.0, 2, BatchOrdering::Random) };
        assert_eq!(cfg.plan(&lengths, 7), cfg.plan(&lengths, 7));
        assert_eq!(cfg.plan(&lengths, 7).concat().len(), 40);
    }

    #[test]
    fn test_validation() {
        assert!(DynamicBatching::default().validate().is_ok());
        assert!(config(0.0, 1, BatchOrdering::Random).validate().is_err());
        assert!(config(1.0, 0, BatchOrdering::Random).validate().is_err());
    }
}
