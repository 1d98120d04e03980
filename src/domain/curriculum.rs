// ============================================================
// Layer 3 — Curriculum Schedule
// ============================================================
// The hybrid model is trained with two objectives:
//
//   L = w · L_ctc + (1 − w) · L_seq     while epoch <= cutoff
//   L = L_seq                           afterwards
//
// CTC learns a monotonic alignment quickly, so it is only kept
// for the first `ctc_cutoff_epoch` epochs. Validation and test
// never blend: they report L_seq alone.
//
// The config is validated once here. Callers derive a
// LossPhase from ONE epoch value per step and hand the same
// phase to the forward pass and to the loss.

use anyhow::{bail, Result};

use crate::domain::stage::Stage;

/// Immutable curriculum settings, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurriculumConfig {
    ctc_cutoff_epoch: usize,
    ctc_weight:       f64,
}

/// Which loss terms are active for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossPhase {
    /// CTC and sequence loss blended with `ctc_weight`
    Joint { ctc_weight: f64 },

    /// Sequence loss only; the CTC head is not evaluated
    SeqOnly,
}

impl CurriculumConfig {
    /// Validate and build the curriculum.
    ///
    /// Rejects a negative cutoff and any weight outside [0, 1]
    /// (NaN included).
    pub fn new(ctc_cutoff_epoch: i64, ctc_weight: f64) -> Result<Self> {
        if ctc_cutoff_epoch < 0 {
            bail!("number_of_ctc_epochs must be >= 0, got {ctc_cutoff_epoch}");
        }
        if !(0.0..=1.0).contains(&ctc_weight) {
            bail!("ctc_weight must lie in [0, 1], got {ctc_weight}");
        }
        Ok(Self {
            ctc_cutoff_epoch: ctc_cutoff_epoch as usize,
            ctc_weight,
        })
    }

    pub fn ctc_cutoff_epoch(&self) -> usize { self.ctc_cutoff_epoch }

    pub fn ctc_weight(&self) -> f64 { self.ctc_weight }

    /// Loss terms for a step of `stage` running in `epoch`.
    pub fn phase(&self, stage: Stage, epoch: usize) -> LossPhase {
        match stage {
            Stage::Train if epoch <= self.ctc_cutoff_epoch => LossPhase::Joint {
                ctc_weight: self.ctc_weight,
            },
            Stage::Train | Stage::Valid | Stage::Test => LossPhase::SeqOnly,
        }
    }
}

impl LossPhase {
    /// True when the forward pass must produce CTC log-probabilities.
    pub fn needs_ctc(self) -> bool {
        matches!(self, LossPhase::Joint { .. })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_weight() {
        assert!(CurriculumConfig::new(1, 1.5).is_err());
        assert!(CurriculumConfig::new(1, -0.1).is_err());
        assert!(CurriculumConfig::new(1, f64::NAN).is_err());
    }

    #[test]
    fn test_rejects_negative_cutoff() {
        assert!(CurriculumConfig::new(-1, 0.3).is_err());
    }

    #[test]
    fn test_boundary_weights_accepted() {
        assert!(CurriculumConfig::new(0, 0.0).is_ok());
        assert!(CurriculumConfig::new(0, 1.0).is_ok());
    }

    #[test]
    fn test_phase_switches_after_cutoff() {
        let cur = CurriculumConfig::new(1, 0.3).unwrap();
        assert_eq!(cur.phase(Stage::Train, 1), LossPhase::Joint { ctc_weight: 0.3 });
        assert_eq!(cur.phase(Stage::Train, 2), LossPhase::SeqOnly);
    }

    #[test]
    fn test_eval_stages_never_blend() {
        let cur = CurriculumConfig::new(10, 0.5).unwrap();
        assert_eq!(cur.phase(Stage::Valid, 1), LossPhase::SeqOnly);
        assert_eq!(cur.phase(Stage::Test,  1), LossPhase::SeqOnly);
        assert!(!cur.phase(Stage::Valid, 1).needs_ctc());
    }
}
