// ============================================================
// Layer 5 — External Language Model
// ============================================================
// Beam search adds `lm_weight · log p_LM(token | prefix)` to
// the acoustic score. The search only needs three things from
// an LM, captured by the LanguageModel trait:
//
//   initial_state(k)        → state for k empty prefixes
//   step(tokens, state)     → next-token log-probs [k, vocab]
//   reorder(state, parents) → follow the surviving beams
//
// The shipped LM is a character-level GRU trained elsewhere
// and loaded from a Burn record. Without a record the LM is
// disabled and contributes nothing.
//
// Reference: Burn Book §3 (Modules), §5 (Records)
//            Rust Book §10 (Traits with associated types)

use anyhow::{Context, Result};
use burn::{
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    prelude::*,
    record::Recorder,
    tensor::activation::log_softmax,
};
use std::path::Path;

use crate::infra::checkpoint::checkpoint_recorder;
use crate::ml::model::GruCell;

pub trait LanguageModel<B: Backend> {
    type State: Clone;

    fn is_enabled(&self) -> bool { true }

    fn initial_state(&self, batch: usize, device: &B::Device) -> Self::State;

    /// tokens: [k] → log-probs [k, vocab] and the advanced state
    fn step(&self, tokens: Tensor<B, 1, Int>, state: Self::State) -> (Tensor<B, 2>, Self::State);

    /// Keep the state rows named by `parents`
    fn reorder(&self, state: Self::State, parents: Tensor<B, 1, Int>) -> Self::State;
}

// ─── RNN LM ───────────────────────────────────────────────────────────────────
#[derive(Config, Debug)]
pub struct RnnLmConfig {
    pub vocab_size: usize,
    #[config(default = 128)]
    pub emb_dim: usize,
    #[config(default = 256)]
    pub hidden_dim: usize,
}

impl RnnLmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RnnLm<B> {
        RnnLm {
            embedding:  EmbeddingConfig::new(self.vocab_size, self.emb_dim).init(device),
            cell:       GruCell::new(self.emb_dim, self.hidden_dim, device),
            output:     LinearConfig::new(self.hidden_dim, self.vocab_size).init(device),
            emb_dim:    self.emb_dim,
            hidden_dim: self.hidden_dim,
        }
    }
}

#[derive(Module, Debug)]
pub struct RnnLm<B: Backend> {
    pub embedding:  Embedding<B>,
    pub cell:       GruCell<B>,
    pub output:     Linear<B>,
    pub emb_dim:    usize,
    pub hidden_dim: usize,
}

impl<B: Backend> RnnLm<B> {
    pub fn load(config: &RnnLmConfig, path: &Path, device: &B::Device) -> Result<Self> {
        let record = Recorder::<B>::load(&checkpoint_recorder(), path.to_path_buf(), device)
            .with_context(|| format!("Cannot load language model '{}'", path.display()))?;
        tracing::info!("Loaded RNN language model from '{}'", path.display());
        Ok(config.init::<B>(device).load_record(record))
    }
}

impl<B: Backend> LanguageModel<B> for RnnLm<B> {
    type State = Tensor<B, 2>;

    fn initial_state(&self, batch: usize, device: &B::Device) -> Self::State {
        Tensor::zeros([batch, self.hidden_dim], device)
    }

    fn step(&self, tokens: Tensor<B, 1, Int>, state: Self::State) -> (Tensor<B, 2>, Self::State) {
        let [k] = tokens.dims();
        let emb    = self.embedding.forward(tokens.unsqueeze_dim::<2>(1)).reshape([k, self.emb_dim]);
        let hidden = self.cell.forward(emb, state);
        (log_softmax(self.output.forward(hidden.clone()), 1), hidden)
    }

    fn reorder(&self, state: Self::State, parents: Tensor<B, 1, Int>) -> Self::State {
        state.select(0, parents)
    }
}

// ─── ExternalLm ───────────────────────────────────────────────────────────────
/// The LM used at test time, or none.
#[derive(Debug)]
pub enum ExternalLm<B: Backend> {
    Rnn(RnnLm<B>),
    Disabled { vocab_size: usize },
}

impl<B: Backend> ExternalLm<B> {
    /// Load the RNN LM when a record path is configured
    pub fn from_path(config: &RnnLmConfig, path: Option<&Path>, device: &B::Device) -> Result<Self> {
        match path {
            Some(p) => Ok(Self::Rnn(RnnLm::load(config, p, device)?)),
            None => {
                tracing::info!("No language model configured; beam search uses acoustic scores only");
                Ok(Self::Disabled { vocab_size: config.vocab_size })
            }
        }
    }
}

impl<B: Backend> LanguageModel<B> for ExternalLm<B> {
    type State = Option<Tensor<B, 2>>;

    fn is_enabled(&self) -> bool {
        matches!(self, Self::Rnn(_))
    }

    fn initial_state(&self, batch: usize, device: &B::Device) -> Self::State {
        match self {
            Self::Rnn(lm)         => Some(lm.initial_state(batch, device)),
            Self::Disabled { .. } => None,
        }
    }

    fn step(&self, tokens: Tensor<B, 1, Int>, state: Self::State) -> (Tensor<B, 2>, Self::State) {
        match (self, state) {
            (Self::Rnn(lm), Some(h)) => {
                let (logp, h) = lm.step(tokens, h);
                (logp, Some(h))
            }
            (Self::Rnn(lm), None) => {
                let [k] = tokens.dims();
                let h = lm.initial_state(k, &tokens.device());
                let (logp, h) = lm.step(tokens, h);
                (logp, Some(h))
            }
            (Self::Disabled { vocab_size }, _) => {
                let [k] = tokens.dims();
                (Tensor::zeros([k, *vocab_size], &tokens.device()), None)
            }
        }
    }

    fn reorder(&self, state: Self::State, parents: Tensor<B, 1, Int>) -> Self::State {
        state.map(|h| h.select(0, parents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::test_utils::TestInner;
    use burn::tensor::TensorData;
    use tempfile::tempdir;

    #[test]
    fn test_step_shapes_and_reorder() {
        let device = Default::default();
        let lm     = RnnLmConfig::new(6).with_emb_dim(4).with_hidden_dim(5).init::<TestInner>(&device);

        let tokens = Tensor::<TestInner, 1, Int>::from_data(TensorData::new(vec![1i64, 3, 4], [3]), &device);
        let state  = lm.initial_state(3, &device);
        let (logp, state) = lm.step(tokens, state);
        assert_eq!(logp.dims(), [3, 6]);

        let parents = Tensor::<TestInner, 1, Int>::from_data(TensorData::new(vec![2i64, 2], [2]), &device);
        let state   = lm.reorder(state, parents);
        assert_eq!(state.dims(), [2, 5]);
    }

    #[test]
    fn test_disabled_lm() {
        let lm: ExternalLm<TestInner> = ExternalLm::from_path(&RnnLmConfig::new(6), None, &Default::default()).unwrap();
        assert!(!lm.is_enabled());

        let tokens = Tensor::<TestInner, 1, Int>::from_data(TensorData::new(vec![1i64, 2], [2]), &Default::default());
        let (logp, state) = lm.step(tokens, None);
        assert_eq!(logp.dims(), [2, 6]);
        assert!(state.is_none());
    }

    #[test]
    fn test_missing_record_is_error() {
        let device = Default::default();
        let result = ExternalLm::<TestInner>::from_path(
            &RnnLmConfig::new(6), Some(Path::new("/nonexistent/lm")), &device,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let device = Default::default();
        let dir    = tempdir().unwrap();
        let path   = dir.path().join("lm");
        let config = RnnLmConfig::new(6).with_emb_dim(4).with_hidden_dim(5);
        let lm     = config.init::<TestInner>(&device);
        Recorder::<TestInner>::record(&checkpoint_recorder(), lm.clone().into_record(), path.clone()).unwrap();

        let loaded = RnnLm::<TestInner>::load(&config, &path, &device).unwrap();
        let a: Vec<f32> = lm.output.weight.val().into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.output.weight.val().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
