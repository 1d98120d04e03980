// ============================================================
// Layer 5 — Loss Composer
// ============================================================
// Two training signals share one encoder:
//
//   CTC loss  — alignment-free, over the encoder frames
//   seq loss  — token NLL of the attention decoder
//
// The composer blends them according to the curriculum:
//
//   TRAIN, epoch <= cutoff : w · L_ctc + (1 - w) · L_seq
//   TRAIN, epoch >  cutoff : L_seq
//   VALID / TEST           : L_seq (reported, never optimised)
//
// CTC is computed with the forward (alpha) recursion in log
// space over the blank-interleaved label sequence
//   blank y1 blank y2 ... yL blank
// Each utterance's negative log-likelihood is divided by its
// target length and the results are averaged over the batch.
// An impossible alignment (more labels than frames allow) adds
// zero, with zero gradient, so the rest of the batch still trains.
//
// Reference: Graves et al. (2006) Connectionist Temporal Classification
//            Szegedy et al. (2016) label smoothing

use anyhow::{bail, Result};
use burn::{prelude::*, tensor::TensorData};

use crate::data::batcher::AsrBatch;
use crate::domain::{
    curriculum::{CurriculumConfig, LossPhase},
    stage::Stage,
};
use crate::ml::model::ModelOutputs;

/// Stand-in for log(0) that keeps the recursion finite
const LOG_ZERO: f32 = -1.0e30;

/// A log-likelihood at or below this has no valid alignment
const IMPOSSIBLE: f32 = LOG_ZERO / 2.0;

/// log(exp(a) + exp(b)), elementwise
fn log_add<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, D> {
    let m = a.clone().max_pair(b.clone());
    m.clone() + ((a - m.clone()).exp() + (b - m).exp()).log()
}

fn log_add3<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, c: Tensor<B, 2>) -> Tensor<B, 2> {
    let m = a.clone().max_pair(b.clone()).max_pair(c.clone());
    m.clone() + ((a - m.clone()).exp() + (b - m.clone()).exp() + (c - m).exp()).log()
}

fn bool_matrix<B: Backend>(data: Vec<bool>, rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2, Bool> {
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

// ─── CTC ──────────────────────────────────────────────────────────────────────
/// CTC loss.
///
/// * `log_probs`  - [batch, frames, classes], log-softmax output
/// * `targets`    - unpadded label ids per utterance (no blanks)
/// * `input_lens` - valid frames per utterance
/// * `blank`      - index of the blank label
///
/// Returns a one-element tensor: the mean over the batch of
/// `-log p(y|x) / len(y)`, where utterances with no valid
/// alignment count as zero.
pub fn ctc_loss<B: Backend>(
    log_probs:  Tensor<B, 3>,
    targets:    &[Vec<usize>],
    input_lens: &[usize],
    blank:      usize,
) -> Tensor<B, 1> {
    let [batch, frames, _] = log_probs.dims();
    let device = log_probs.device();

    let max_label = targets.iter().map(Vec::len).max().unwrap_or(0);
    let states    = 2 * max_label + 1;

    // ── Extended label sequences and skip permissions ─────────────────────────
    let mut ext     = vec![blank as i64; batch * states];
    let mut no_skip = vec![true; batch * states];
    for (b, tgt) in targets.iter().enumerate() {
        for (k, &label) in tgt.iter().enumerate() {
            let s = 2 * k + 1;
            ext[b * states + s] = label as i64;
            // s-2 → s is allowed between two different labels
            if k > 0 && tgt[k - 1] != label {
                no_skip[b * states + s] = false;
            }
        }
    }

    // emit[b, t, s] = log_probs[b, t, ext[b, s]]
    let index: Vec<i64> = (0..batch)
        .flat_map(|b| {
            let row = &ext[b * states..(b + 1) * states];
            (0..frames).flat_map(move |_| row.iter().copied())
        })
        .collect();
    let index = Tensor::<B, 3, Int>::from_data(TensorData::new(index, [batch, frames, states]), &device);
    let emit  = log_probs.gather(2, index);

    let no_skip = bool_matrix::<B>(no_skip, batch, states, &device);
    let init_mask: Vec<bool> = (0..batch).flat_map(|_| (0..states).map(|s| s >= 2)).collect();
    let init_mask = bool_matrix::<B>(init_mask, batch, states, &device);

    // ── t = 0: only the leading blank and the first label ─────────────────────
    let mut alpha = emit.clone()
        .slice([0..batch, 0..1, 0..states])
        .reshape([batch, states])
        .mask_fill(init_mask, LOG_ZERO);

    // ── Forward recursion ─────────────────────────────────────────────────────
    for t in 1..frames {
        let from_prev = if states > 1 {
            Tensor::cat(vec![
                Tensor::full([batch, 1], LOG_ZERO, &device),
                alpha.clone().slice([0..batch, 0..states - 1]),
            ], 1)
        } else {
            Tensor::full([batch, states], LOG_ZERO, &device)
        };
        let from_skip = if states > 2 {
            Tensor::cat(vec![
                Tensor::full([batch, 2], LOG_ZERO, &device),
                alpha.clone().slice([0..batch, 0..states - 2]),
            ], 1)
            .mask_fill(no_skip.clone(), LOG_ZERO)
        } else {
            Tensor::full([batch, states], LOG_ZERO, &device)
        };

        let emit_t = emit.clone()
            .slice([0..batch, t..t + 1, 0..states])
            .reshape([batch, states]);
        let next = log_add3(alpha.clone(), from_prev, from_skip) + emit_t;

        // frames past an utterance's end leave its alpha untouched
        let active: Vec<bool> = input_lens
            .iter()
            .flat_map(|&len| std::iter::repeat(t < len).take(states))
            .collect();
        alpha = alpha.mask_where(bool_matrix::<B>(active, batch, states, &device), next);
    }

    // ── log p(y|x) = logsumexp(alpha[2L], alpha[2L - 1]) ──────────────────────
    let mut ends      = Vec::with_capacity(batch * 2);
    let mut no_second = Vec::with_capacity(batch * 2);
    for tgt in targets {
        let last = 2 * tgt.len();
        ends.push(last as i64);
        ends.push(last.saturating_sub(1) as i64);
        no_second.push(false);
        no_second.push(tgt.is_empty());
    }
    let ends = Tensor::<B, 2, Int>::from_data(TensorData::new(ends, [batch, 2]), &device);
    let ends = alpha
        .gather(1, ends)
        .mask_fill(bool_matrix::<B>(no_second, batch, 2, &device), LOG_ZERO);
    let log_lik = log_add(
        ends.clone().slice([0..batch, 0..1]),
        ends.slice([0..batch, 1..2]),
    )
    .reshape([batch]);

    let norm: Vec<f32> = targets.iter().map(|t| t.len().max(1) as f32).collect();
    let norm = Tensor::<B, 1>::from_data(TensorData::new(norm, [batch]), &device);

    let impossible = log_lik.clone().lower_equal_elem(IMPOSSIBLE);
    (log_lik.neg() / norm).mask_fill(impossible, 0.0).mean()
}

// ─── Sequence NLL ─────────────────────────────────────────────────────────────
/// Token NLL averaged over the real (unpadded) target positions.
///
/// * `log_probs`   - [batch, steps, classes]
/// * `targets`     - [batch, steps], padded
/// * `target_lens` - real positions per row
pub fn nll_loss<B: Backend>(
    log_probs:       Tensor<B, 3>,
    targets:         Tensor<B, 2, Int>,
    target_lens:     &[usize],
    label_smoothing: f64,
) -> Tensor<B, 1> {
    let [batch, steps, _] = log_probs.dims();
    let device = log_probs.device();

    let mask: Vec<f32> = target_lens
        .iter()
        .flat_map(|&len| (0..steps).map(move |u| if u < len { 1.0 } else { 0.0 }))
        .collect();
    let count = mask.iter().sum::<f32>().max(1.0) as f64;
    let mask  = Tensor::<B, 2>::from_data(TensorData::new(mask, [batch, steps]), &device);

    let picked = log_probs.clone()
        .gather(2, targets.unsqueeze_dim::<3>(2))
        .reshape([batch, steps]);
    let nll = (picked * mask.clone()).sum().neg().div_scalar(count);

    if label_smoothing <= 0.0 {
        return nll;
    }

    // cross-entropy against the uniform distribution
    let uniform = log_probs.mean_dim(2).reshape([batch, steps]);
    let smooth  = (uniform * mask).sum().neg().div_scalar(count);
    nll.mul_scalar(1.0 - label_smoothing) + smooth.mul_scalar(label_smoothing)
}

// ─── Composer ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy)]
pub struct LossComposer {
    curriculum:      CurriculumConfig,
    blank:           usize,
    label_smoothing: f64,
}

impl LossComposer {
    pub fn new(curriculum: CurriculumConfig, blank: usize, label_smoothing: f64) -> Self {
        Self { curriculum, blank, label_smoothing }
    }

    /// The loss phase for one step; the forward pass uses the same value.
    pub fn phase(&self, stage: Stage, epoch: usize) -> LossPhase {
        self.curriculum.phase(stage, epoch)
    }

    pub fn compose<B: Backend>(
        &self,
        outputs: &ModelOutputs<B>,
        batch:   &AsrBatch<B>,
        stage:   Stage,
        epoch:   usize,
    ) -> Result<Tensor<B, 1>> {
        let seq = nll_loss(
            outputs.seq_logp.clone(),
            batch.tokens_eos.clone(),
            &batch.tokens_eos_lens,
            self.label_smoothing,
        );

        match self.phase(stage, epoch) {
            LossPhase::SeqOnly => Ok(seq),
            LossPhase::Joint { ctc_weight } => {
                let Some(ctc_logp) = &outputs.ctc_logp else {
                    bail!("epoch {epoch} trains with CTC but the forward pass produced no CTC output");
                };
                let ctc = ctc_loss(
                    ctc_logp.clone(),
                    &batch.targets,
                    &outputs.encoder.lengths,
                    self.blank,
                );
                Ok(ctc.mul_scalar(ctc_weight) + seq.mul_scalar(1.0 - ctc_weight))
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::test_utils::{synthetic_batch, tiny_config, tiny_encoder, TestInner};

    fn scalar(t: Tensor<TestInner, 1>) -> f32 {
        t.into_scalar()
    }

    fn log_probs(rows: Vec<Vec<f32>>) -> Tensor<TestInner, 3> {
        let frames  = rows.len();
        let classes = rows[0].len();
        let flat: Vec<f32> = rows.into_iter().flatten().map(f32::ln).collect();
        Tensor::from_data(TensorData::new(flat, [1, frames, classes]), &Default::default())
    }

    #[test]
    fn test_ctc_single_frame() {
        // one frame, one label with p = 0.6
        let lp   = log_probs(vec![vec![0.4, 0.6]]);
        let loss = scalar(ctc_loss(lp, &[vec![1]], &[1], 0));
        assert!((loss - (-(0.6f32).ln())).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_two_frames_uniform() {
        // paths for "1" over 2 frames: (1,1) (0,1) (1,0) → 3 · 0.25
        let lp   = log_probs(vec![vec![0.5, 0.5], vec![0.5, 0.5]]);
        let loss = scalar(ctc_loss(lp, &[vec![1]], &[2], 0));
        assert!((loss - (-(0.75f32).ln())).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_repeated_label_needs_blank() {
        // "1 1" over 2 frames is impossible: the blank between them is required
        let lp   = log_probs(vec![vec![0.5, 0.5], vec![0.5, 0.5]]);
        let loss = scalar(ctc_loss(lp, &[vec![1, 1]], &[2], 0));
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_ctc_impossible_utterance_adds_zero() {
        // row 0: "1" over one frame, p = 0.6; row 1: "1 2" cannot fit in one frame
        let flat: Vec<f32> = [0.4f32, 0.6, 0.0001, 0.3, 0.3, 0.3999]
            .into_iter()
            .map(f32::ln)
            .collect();
        let lp   = Tensor::<TestInner, 3>::from_data(TensorData::new(flat, [2, 1, 3]), &Default::default());
        let loss = scalar(ctc_loss(lp, &[vec![1], vec![1, 2]], &[1, 1], 0));
        assert!((loss - (-(0.6f32).ln()) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_normalised_by_target_length() {
        // "1 2" over 2 frames, only path (1, 2): p = 0.5 · 0.5
        let lp   = log_probs(vec![vec![0.25, 0.5, 0.25], vec![0.25, 0.25, 0.5]]);
        let loss = scalar(ctc_loss(lp, &[vec![1, 2]], &[2], 0));
        let expected = -(0.25f32).ln() / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_ignores_padded_frames() {
        // frame 2 is padding and must not change the result
        let lp   = log_probs(vec![vec![0.4, 0.6], vec![0.9, 0.1]]);
        let loss = scalar(ctc_loss(lp, &[vec![1]], &[1], 0));
        assert!((loss - (-(0.6f32).ln())).abs() < 1e-5);
    }

    #[test]
    fn test_nll_masks_padding() {
        let device = Default::default();
        let lp = Tensor::<TestInner, 3>::from_data(
            TensorData::new(vec![0.5f32.ln(), 0.5f32.ln(), 0.25f32.ln(), 0.75f32.ln()], [1, 2, 2]),
            &device,
        );
        let targets = Tensor::<TestInner, 2, Int>::from_data(TensorData::new(vec![1i64, 0], [1, 2]), &device);
        // only the first position counts
        let loss = scalar(nll_loss(lp, targets, &[1], 0.0));
        assert!((loss - (-(0.5f32).ln())).abs() < 1e-5);
    }

    #[test]
    fn test_blend_before_cutoff() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab", "ba b"], 5, &device);

        let composer = LossComposer::new(CurriculumConfig::new(2, 0.3).unwrap(), 0, 0.1);
        let phase    = composer.phase(Stage::Train, 2);
        let outputs  = model.forward(&batch, phase);

        let total = scalar(composer.compose(&outputs, &batch, Stage::Train, 2).unwrap());
        let seq   = scalar(nll_loss(outputs.seq_logp.clone(), batch.tokens_eos.clone(), &batch.tokens_eos_lens, 0.1));
        let ctc   = scalar(ctc_loss(outputs.ctc_logp.clone().unwrap(), &batch.targets, &outputs.encoder.lengths, 0));

        assert!((total - (0.3 * ctc + 0.7 * seq)).abs() < 1e-4);
    }

    #[test]
    fn test_seq_only_after_cutoff() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab", "ba b"], 5, &device);

        let composer = LossComposer::new(CurriculumConfig::new(2, 0.3).unwrap(), 0, 0.1);
        let phase    = composer.phase(Stage::Train, 3);
        let outputs  = model.forward(&batch, phase);
        assert!(outputs.ctc_logp.is_none());

        let total = scalar(composer.compose(&outputs, &batch, Stage::Train, 3).unwrap());
        let seq   = scalar(nll_loss(outputs.seq_logp.clone(), batch.tokens_eos.clone(), &batch.tokens_eos_lens, 0.1));
        assert_eq!(total.to_bits(), seq.to_bits());
    }

    #[test]
    fn test_evaluation_stages_are_seq_only() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["a"], 9, &device);

        let composer = LossComposer::new(CurriculumConfig::new(10, 0.5).unwrap(), 0, 0.0);
        for stage in [Stage::Valid, Stage::Test] {
            let outputs = model.forward(&batch, composer.phase(stage, 1));
            assert!(outputs.ctc_logp.is_none());
            assert!(composer.compose(&outputs, &batch, stage, 1).is_ok());
        }
    }

    #[test]
    fn test_missing_ctc_output_is_error() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["a"], 9, &device);

        let composer = LossComposer::new(CurriculumConfig::new(3, 0.5).unwrap(), 0, 0.0);
        let outputs  = model.forward(&batch, LossPhase::SeqOnly);
        assert!(composer.compose(&outputs, &batch, Stage::Train, 1).is_err());
    }
}
