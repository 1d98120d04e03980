// ============================================================
// Layer 5 — Decoder Selector
// ============================================================
// Turns encoder output into hypotheses. Which search runs is
// decided by the stage alone:
//
//   VALID → greedy search   (fast, one pass per epoch)
//   TEST  → beam search + external LM
//   TRAIN → never decodes; asking for it is an error
//
// Both searches are stateless between calls. For an utterance
// with T valid frames:
//
//   max steps = round(T · max_decode_ratio)   (then truncated)
//   min steps = round(T · min_decode_ratio)   (EOS suppressed before)
//
// Beam scoring for a candidate extension:
//   score(prefix) + log p_AM(token) + lm_weight · log p_LM(token)
// A beam that picks EOS is finished; the search stops once
// `beam_size` beams have finished or the step bound is hit.
// With one beam and lm_weight 0 the beam search makes exactly
// the greedy choices.
//
// Scores are moved to the host at every step so candidate
// selection is plain Rust sorting.
//
// Reference: Burn Book §3 (Tensors)
//            Graves (2012) Sequence Transduction with RNNs (beam search)

use anyhow::{anyhow, bail, Result};
use burn::{prelude::*, tensor::TensorData};

use crate::domain::{hypothesis::Hypothesis, stage::Stage};
use crate::ml::{
    lm::LanguageModel,
    model::{EncoderOutput, Seq2SeqHead},
};

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub bos:                  usize,
    pub eos:                  usize,
    pub min_decode_ratio:     f64,
    pub max_decode_ratio:     f64,
    pub beam_size:            usize,
    pub lm_weight:            f64,
    pub length_normalization: bool,
}

impl SearchConfig {
    /// (min, max) decoding steps for `frames` valid frames
    pub fn bounds(&self, frames: usize) -> (usize, usize) {
        let min = (frames as f64 * self.min_decode_ratio).round() as usize;
        let max = (frames as f64 * self.max_decode_ratio).round() as usize;
        (min.min(max), max)
    }
}

fn to_host<B: Backend>(t: Tensor<B, 2>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Cannot read decoder scores: {e:?}"))
}

fn int_vector<B: Backend>(values: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    Tensor::from_data(TensorData::new(data, [values.len()]), device)
}

/// First index of the largest score, skipping `eos` when suppressed
fn best_token(row: &[f32], eos: usize, suppress_eos: bool) -> (usize, f32) {
    let mut best = (0usize, f32::NEG_INFINITY);
    let mut found = false;
    for (idx, &score) in row.iter().enumerate() {
        if suppress_eos && idx == eos {
            continue;
        }
        if !found || score > best.1 {
            best  = (idx, score);
            found = true;
        }
    }
    best
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<usize>,
    score:  f32,
}

// ─── DecoderSelector ──────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DecoderSelector {
    config: SearchConfig,
}

impl DecoderSelector {
    pub fn new(config: SearchConfig) -> Result<Self> {
        if config.beam_size == 0 {
            bail!("beam_size must be at least 1");
        }
        if !(config.min_decode_ratio >= 0.0 && config.max_decode_ratio >= config.min_decode_ratio) {
            bail!(
                "decode ratios must satisfy 0 <= min ({}) <= max ({})",
                config.min_decode_ratio, config.max_decode_ratio
            );
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SearchConfig { &self.config }

    /// Decode every utterance in `enc` with the search for `stage`.
    pub fn decode<B: Backend, L: LanguageModel<B>>(
        &self,
        head:  &Seq2SeqHead<B>,
        enc:   &EncoderOutput<B>,
        stage: Stage,
        lm:    &L,
    ) -> Result<Vec<Hypothesis>> {
        match stage {
            Stage::Train => bail!("decoding is not run during the train stage"),
            Stage::Valid => self.greedy(head, enc),
            Stage::Test  => self.beam(head, enc, lm),
        }
    }

    // ─── Greedy ───────────────────────────────────────────────────────────────
    /// Batched argmax decoding.
    pub fn greedy<B: Backend>(&self, head: &Seq2SeqHead<B>, enc: &EncoderOutput<B>) -> Result<Vec<Hypothesis>> {
        let cfg    = &self.config;
        let batch  = enc.batch_size();
        let device = enc.states.device();

        let bounds: Vec<(usize, usize)> = enc.lengths.iter().map(|&t| cfg.bounds(t)).collect();
        let max_steps = bounds.iter().map(|b| b.1).max().unwrap_or(0);

        let mut state  = head.initial_state(batch, &device);
        let mut inputs = vec![cfg.bos; batch];
        let mut tokens = vec![Vec::new(); batch];
        let mut scores = vec![0.0f32; batch];
        let mut done: Vec<bool> = bounds.iter().map(|b| b.1 == 0).collect();

        for step in 0..max_steps {
            if done.iter().all(|&d| d) {
                break;
            }
            let (logp, next) = head.decode_step(int_vector::<B>(&inputs, &device), state, enc);
            state = next;

            let rows    = to_host(logp)?;
            let classes = rows.len() / batch;

            for b in 0..batch {
                if done[b] {
                    continue;
                }
                let row = &rows[b * classes..(b + 1) * classes];
                let (token, lp) = best_token(row, cfg.eos, step < bounds[b].0);
                scores[b] += lp;
                if token == cfg.eos {
                    done[b] = true;
                } else {
                    tokens[b].push(token);
                    inputs[b] = token;
                    // max length reached: keep the truncated hypothesis
                    if step + 1 >= bounds[b].1 {
                        done[b] = true;
                    }
                }
            }
        }

        Ok(tokens
            .into_iter()
            .zip(scores)
            .map(|(t, s)| Hypothesis::new(t, s))
            .collect())
    }

    // ─── Beam ─────────────────────────────────────────────────────────────────
    /// Beam search with shallow LM fusion, one utterance at a time.
    pub fn beam<B: Backend, L: LanguageModel<B>>(
        &self,
        head: &Seq2SeqHead<B>,
        enc:  &EncoderOutput<B>,
        lm:   &L,
    ) -> Result<Vec<Hypothesis>> {
        (0..enc.batch_size())
            .map(|i| self.beam_one(head, &enc.utterance(i), lm))
            .collect()
    }

    fn beam_one<B: Backend, L: LanguageModel<B>>(
        &self,
        head: &Seq2SeqHead<B>,
        enc:  &EncoderOutput<B>,
        lm:   &L,
    ) -> Result<Hypothesis> {
        let cfg    = &self.config;
        let device = enc.states.device();
        let (min_len, max_len) = cfg.bounds(enc.lengths[0]);
        let use_lm = cfg.lm_weight != 0.0 && lm.is_enabled();

        let mut alive    = vec![Beam { tokens: Vec::new(), score: 0.0 }];
        let mut finished: Vec<Beam> = Vec::new();
        let mut enc_k    = enc.clone();
        let mut dec      = head.initial_state(1, &device);
        let mut lm_state = lm.initial_state(1, &device);

        for step in 0..max_len {
            let k    = alive.len();
            let last: Vec<usize> = alive
                .iter()
                .map(|b| b.tokens.last().copied().unwrap_or(cfg.bos))
                .collect();
            let inputs = int_vector::<B>(&last, &device);

            let (am, next_dec) = head.decode_step(inputs.clone(), dec, &enc_k);
            let am = to_host(am)?;
            let (lm_scores, next_lm) = if use_lm {
                let (l, s) = lm.step(inputs, lm_state);
                (Some(to_host(l)?), s)
            } else {
                (None, lm_state)
            };
            let classes = am.len() / k;

            // ── Expand every alive beam by every token ────────────────────────
            let mut candidates: Vec<(f32, usize, usize)> = Vec::with_capacity(k * classes);
            for (parent, beam) in alive.iter().enumerate() {
                for token in 0..classes {
                    if token == cfg.eos && step < min_len {
                        continue;
                    }
                    let mut s = am[parent * classes + token];
                    if let Some(l) = &lm_scores {
                        s += cfg.lm_weight as f32 * l[parent * classes + token];
                    }
                    candidates.push((beam.score + s, parent, token));
                }
            }
            // stable: equal scores keep (parent, token) order
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(cfg.beam_size);

            // ── Split finished from alive ─────────────────────────────────────
            let mut next_alive = Vec::with_capacity(candidates.len());
            let mut parents    = Vec::with_capacity(candidates.len());
            for (score, parent, token) in candidates {
                let mut tokens = alive[parent].tokens.clone();
                if token == cfg.eos {
                    finished.push(Beam { tokens, score });
                } else {
                    tokens.push(token);
                    next_alive.push(Beam { tokens, score });
                    parents.push(parent);
                }
            }

            alive = next_alive;
            if finished.len() >= cfg.beam_size || alive.is_empty() {
                break;
            }

            let parents = int_vector::<B>(&parents, &device);
            dec      = next_dec.select(parents.clone());
            lm_state = lm.reorder(next_lm, parents);
            if alive.len() != k {
                enc_k = enc.repeat(alive.len());
            }
        }

        // alive beams hitting the step bound count as truncated hypotheses
        let pool = if finished.is_empty() { alive } else { finished };
        let best = pool
            .into_iter()
            .map(|b| {
                let score = if cfg.length_normalization {
                    b.score / b.tokens.len().max(1) as f32
                } else {
                    b.score
                };
                Beam { tokens: b.tokens, score }
            })
            .reduce(|best, b| if b.score > best.score { b } else { best })
            .unwrap_or(Beam { tokens: Vec::new(), score: 0.0 });

        Ok(Hypothesis::new(best.tokens, best.score))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{
        lm::{ExternalLm, RnnLmConfig},
        test_utils::{synthetic_batch, tiny_config, tiny_encoder, TestInner},
    };

    fn search(beam_size: usize, lm_weight: f64) -> DecoderSelector {
        DecoderSelector::new(SearchConfig {
            bos: 1,
            eos: 2,
            min_decode_ratio: 0.0,
            max_decode_ratio: 1.0,
            beam_size,
            lm_weight,
            length_normalization: true,
        })
        .unwrap()
    }

    #[test]
    fn test_bounds() {
        let cfg = SearchConfig {
            bos: 1, eos: 2, min_decode_ratio: 0.1, max_decode_ratio: 0.5,
            beam_size: 1, lm_weight: 0.0, length_normalization: false,
        };
        assert_eq!(cfg.bounds(10), (1, 5));
        assert_eq!(cfg.bounds(0), (0, 0));
    }

    #[test]
    fn test_best_token_first_max_and_suppression() {
        assert_eq!(best_token(&[0.1, 0.5, 0.5], 2, false).0, 1);
        assert_eq!(best_token(&[0.1, 0.2, 0.9], 2, true).0, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = search(1, 0.0).config().clone();
        cfg.beam_size = 0;
        assert!(DecoderSelector::new(cfg.clone()).is_err());
        cfg.beam_size = 2;
        cfg.min_decode_ratio = 2.0;
        assert!(DecoderSelector::new(cfg).is_err());
    }

    #[test]
    fn test_train_stage_rejected() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab"], 1, &device);
        let enc     = model.encode(batch.wavs.clone(), &batch.wav_lens);
        let lm      = ExternalLm::<TestInner>::Disabled { vocab_size: encoder.len() };
        assert!(search(1, 0.0).decode(&model.head, &enc, Stage::Train, &lm).is_err());
    }

    #[test]
    fn test_greedy_respects_max_length() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab", "ba ab"], 2, &device);
        let enc     = model.encode(batch.wavs.clone(), &batch.wav_lens);

        let hyps = search(1, 0.0).greedy(&model.head, &enc).unwrap();
        assert_eq!(hyps.len(), 2);
        for (hyp, &frames) in hyps.iter().zip(&enc.lengths) {
            assert!(hyp.len() <= frames);
            assert!(!hyp.tokens.contains(&2));
        }
    }

    #[test]
    fn test_beam_of_one_without_lm_equals_greedy() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab", "b a", "abba"], 4, &device);
        let enc     = model.encode(batch.wavs.clone(), &batch.wav_lens);

        // a real LM with weight 0 must not change anything
        let lm = ExternalLm::Rnn(
            RnnLmConfig::new(encoder.len()).with_emb_dim(4).with_hidden_dim(4).init::<TestInner>(&device),
        );
        let selector = search(1, 0.0);
        let greedy   = selector.decode(&model.head, &enc, Stage::Valid, &lm).unwrap();
        let beam     = selector.decode(&model.head, &enc, Stage::Test, &lm).unwrap();

        let g: Vec<_> = greedy.iter().map(|h| h.tokens.clone()).collect();
        let b: Vec<_> = beam.iter().map(|h| h.tokens.clone()).collect();
        assert_eq!(g, b);
    }

    #[test]
    fn test_wide_beam_with_lm_runs() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab", "b a"], 8, &device);
        let enc     = model.encode(batch.wavs.clone(), &batch.wav_lens);
        let lm = ExternalLm::Rnn(
            RnnLmConfig::new(encoder.len()).with_emb_dim(4).with_hidden_dim(4).init::<TestInner>(&device),
        );

        let hyps = search(3, 0.5).decode(&model.head, &enc, Stage::Test, &lm).unwrap();
        assert_eq!(hyps.len(), 2);
        for (hyp, &frames) in hyps.iter().zip(&enc.lengths) {
            assert!(hyp.len() <= frames);
            assert!(hyp.score.is_finite());
        }
    }
}
