// ============================================================
// Layer 3 — Execution Stage and Epoch Counter
// ============================================================
// Every step of the supervisor runs under exactly one Stage.
// Components receive the stage as a plain value and branch on
// it with an exhaustive match:
//
//   Train → loss blending, backward pass, optimiser step
//   Valid → greedy decoding, WER/CER, annealing, checkpoint
//   Test  → beam search + LM, WER/CER, final report
//
// The EpochCounter counts COMPLETED epochs. It only moves
// forward and is stored verbatim inside every checkpoint so a
// resumed run continues with the next epoch number.
//
// Reference: Rust Book §6 (Enums and Pattern Matching)

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three execution stages of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Train,
    Valid,
    Test,
}

impl Stage {
    /// True for the stages that decode and score hypotheses.
    pub fn is_evaluation(self) -> bool {
        match self {
            Stage::Train                => false,
            Stage::Valid | Stage::Test  => true,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Train => "train",
            Stage::Valid => "valid",
            Stage::Test  => "test",
        };
        f.write_str(name)
    }
}

// ─── EpochCounter ─────────────────────────────────────────────────────────────
/// Counts completed epochs against a fixed budget.
///
/// Epoch numbers are 1-based: the first epoch to run is epoch 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCounter {
    /// Number of epochs fully completed (TRAIN + VALID)
    completed: usize,

    /// Total epoch budget for the run
    limit: usize,
}

impl EpochCounter {
    /// A fresh counter: nothing completed yet.
    pub fn new(limit: usize) -> Self {
        Self { completed: 0, limit }
    }

    /// Rebuild a counter from a checkpoint.
    /// The budget comes from the current configuration, so a
    /// resumed run may extend the original one.
    pub fn restore(completed: usize, limit: usize) -> Self {
        Self { completed, limit }
    }

    /// The epoch that should run next, or None when the budget is spent.
    pub fn next_epoch(&self) -> Option<usize> {
        (self.completed < self.limit).then(|| self.completed + 1)
    }

    /// Mark `epoch` as completed. The counter never decreases.
    pub fn complete(&mut self, epoch: usize) {
        self.completed = self.completed.max(epoch);
    }

    pub fn completed(&self) -> usize { self.completed }

    pub fn limit(&self) -> usize { self.limit }

    pub fn is_exhausted(&self) -> bool {
        self.completed >= self.limit
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_runs_full_budget() {
        let mut counter = EpochCounter::new(3);
        let mut seen    = Vec::new();
        while let Some(epoch) = counter.next_epoch() {
            seen.push(epoch);
            counter.complete(epoch);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(counter.is_exhausted());
    }

    #[test]
    fn test_counter_never_decreases() {
        let mut counter = EpochCounter::new(5);
        counter.complete(3);
        counter.complete(1);
        assert_eq!(counter.completed(), 3);
        assert_eq!(counter.next_epoch(), Some(4));
    }

    #[test]
    fn test_restored_counter_continues() {
        let counter = EpochCounter::restore(2, 4);
        assert_eq!(counter.next_epoch(), Some(3));

        let done = EpochCounter::restore(4, 4);
        assert_eq!(done.next_epoch(), None);
    }

    #[test]
    fn test_stage_evaluation_flag() {
        assert!(!Stage::Train.is_evaluation());
        assert!(Stage::Valid.is_evaluation());
        assert!(Stage::Test.is_evaluation());
        assert_eq!(Stage::Valid.to_string(), "valid");
    }
}
