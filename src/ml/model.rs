// ============================================================
// Layer 5 — Acoustic Model
// ============================================================
// A compact hybrid CTC/attention recognizer in two parameter
// groups, each trained by its own optimizer:
//
//   FeatureExtractor  (the "pretrained" group)
//     waveform [B, N] → strided Conv1d framing → GELU
//                     → Linear → GELU → LayerNorm → [B, T, F]
//
//   Seq2SeqHead       (everything else)
//     encoder : 2-layer DNN over frames      → states [B, T, E]
//     ctc_lin : states → CTC log-probs       → [B, T, C]
//     decoder : GRU cell + dot-product attention over states,
//               one step per output token    → [B, U, C]
//
// Frame lengths follow the convolution arithmetic:
//   frames(n) = (n - frame_size) / frame_stride + 1
// and padded frames are masked out of the attention.
//
// Reference: Burn Book §3 (Building Blocks)
//            Chorowski et al. (2015) Attention-Based Models for Speech Recognition

use anyhow::{Context, Result};
use burn::{
    nn::{
        conv::{Conv1d, Conv1dConfig},
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    record::Recorder,
    tensor::{
        activation::{gelu, log_softmax, sigmoid, softmax, tanh},
        TensorData,
    },
};
use std::path::Path;

use crate::data::batcher::AsrBatch;
use crate::domain::curriculum::LossPhase;
use crate::infra::checkpoint::checkpoint_recorder;

/// Score given to padded frames before the attention softmax
const MASKED_SCORE: f32 = -1.0e9;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally; deriving them again gives conflicting impls.
#[derive(Config, Debug)]
pub struct AsrModelConfig {
    pub vocab_size: usize,
    #[config(default = 400)]
    pub frame_size: usize,
    #[config(default = 320)]
    pub frame_stride: usize,
    #[config(default = 256)]
    pub feature_dim: usize,
    #[config(default = 256)]
    pub enc_dim: usize,
    #[config(default = 128)]
    pub emb_dim: usize,
    #[config(default = 256)]
    pub dec_dim: usize,
    #[config(default = 128)]
    pub attn_dim: usize,
    #[config(default = 0.15)]
    pub dropout: f64,
}

impl AsrModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AsrModel<B> {
        AsrModel {
            extractor: self.init_extractor(device),
            head:      self.init_head(device),
        }
    }

    fn init_extractor<B: Backend>(&self, device: &B::Device) -> FeatureExtractor<B> {
        let conv = Conv1dConfig::new(1, self.feature_dim, self.frame_size)
            .with_stride(self.frame_stride)
            .init(device);
        FeatureExtractor {
            conv,
            proj:         LinearConfig::new(self.feature_dim, self.feature_dim).init(device),
            norm:         LayerNormConfig::new(self.feature_dim).init(device),
            frame_size:   self.frame_size,
            frame_stride: self.frame_stride,
        }
    }

    fn init_head<B: Backend>(&self, device: &B::Device) -> Seq2SeqHead<B> {
        Seq2SeqHead {
            enc_in:      LinearConfig::new(self.feature_dim, self.enc_dim).init(device),
            enc_out:     LinearConfig::new(self.enc_dim, self.enc_dim).init(device),
            enc_dropout: DropoutConfig::new(self.dropout).init(),
            embedding:   EmbeddingConfig::new(self.vocab_size, self.emb_dim).init(device),
            cell:        GruCell::new(self.emb_dim + self.enc_dim, self.dec_dim, device),
            attn_query:  LinearConfig::new(self.dec_dim, self.attn_dim).init(device),
            attn_key:    LinearConfig::new(self.enc_dim, self.attn_dim).init(device),
            attn_out:    LinearConfig::new(self.dec_dim + self.enc_dim, self.dec_dim).init(device),
            seq_lin:     LinearConfig::new(self.dec_dim, self.vocab_size).init(device),
            ctc_lin:     LinearConfig::new(self.enc_dim, self.vocab_size).init(device),
            emb_dim:     self.emb_dim,
            enc_dim:     self.enc_dim,
            dec_dim:     self.dec_dim,
            attn_dim:    self.attn_dim,
        }
    }
}

// ─── GRU Cell ─────────────────────────────────────────────────────────────────
/// Single-step GRU, shared by the attention decoder and the RNN LM.
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    pub input_proj:  Linear<B>,
    pub hidden_proj: Linear<B>,
    pub hidden_size: usize,
}

impl<B: Backend> GruCell<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            input_proj:  LinearConfig::new(input_size, 3 * hidden_size).init(device),
            hidden_proj: LinearConfig::new(hidden_size, 3 * hidden_size).init(device),
            hidden_size,
        }
    }

    /// x: [batch, input], h: [batch, hidden] → [batch, hidden]
    pub fn forward(&self, x: Tensor<B, 2>, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = x.dims();
        let hs = self.hidden_size;

        let gx = self.input_proj.forward(x);
        let gh = self.hidden_proj.forward(h.clone());

        let reset  = sigmoid(gx.clone().slice([0..batch, 0..hs]) + gh.clone().slice([0..batch, 0..hs]));
        let update = sigmoid(gx.clone().slice([0..batch, hs..2 * hs]) + gh.clone().slice([0..batch, hs..2 * hs]));
        let cand   = tanh(gx.slice([0..batch, 2 * hs..3 * hs]) + reset * gh.slice([0..batch, 2 * hs..3 * hs]));

        // h' = (1 - z) * n + z * h
        cand.clone() + update * (h - cand)
    }
}

// ─── Feature Extractor ────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    pub conv:         Conv1d<B>,
    pub proj:         Linear<B>,
    pub norm:         LayerNorm<B>,
    pub frame_size:   usize,
    pub frame_stride: usize,
}

impl<B: Backend> FeatureExtractor<B> {
    /// wavs: [batch, samples] → features: [batch, frames, feature_dim]
    pub fn forward(&self, wavs: Tensor<B, 2>) -> Tensor<B, 3> {
        let x = self.conv.forward(wavs.unsqueeze_dim::<3>(1)); // [B, F, T]
        let x = gelu(x).swap_dims(1, 2);                       // [B, T, F]
        self.norm.forward(gelu(self.proj.forward(x)))
    }

    /// Valid frame count for each unpadded waveform length
    pub fn frame_lengths(&self, wav_lens: &[usize]) -> Vec<usize> {
        wav_lens
            .iter()
            .map(|&n| n.saturating_sub(self.frame_size) / self.frame_stride + 1)
            .collect()
    }

    /// Replace the parameters with a record saved by an earlier run
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let record = Recorder::<B>::load(&checkpoint_recorder(), path.to_path_buf(), device)
            .with_context(|| format!("Cannot load pretrained extractor '{}'", path.display()))?;
        tracing::info!("Loaded pretrained feature extractor from '{}'", path.display());
        Ok(self.load_record(record))
    }
}

// ─── Encoder Output ───────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// [batch, frames, enc_dim]
    pub states: Tensor<B, 3>,
    /// Attention keys [batch, frames, attn_dim]
    pub keys: Tensor<B, 3>,
    /// true on padded frames, [batch, frames]
    pub pad_mask: Tensor<B, 2, Bool>,
    /// Valid frames per utterance
    pub lengths: Vec<usize>,
}

impl<B: Backend> EncoderOutput<B> {
    pub fn batch_size(&self) -> usize { self.lengths.len() }

    /// Utterance `i` alone, trimmed to its valid frames
    pub fn utterance(&self, i: usize) -> Self {
        let [_, _, e] = self.states.dims();
        let [_, _, a] = self.keys.dims();
        let t = self.lengths[i].max(1);
        let device = self.states.device();
        Self {
            states:   self.states.clone().slice([i..i + 1, 0..t, 0..e]),
            keys:     self.keys.clone().slice([i..i + 1, 0..t, 0..a]),
            pad_mask: padding_mask::<B>(&[t], t, &device),
            lengths:  vec![t],
        }
    }

    /// Stack `k` copies of a single-utterance output
    pub fn repeat(&self, k: usize) -> Self {
        Self {
            states:   Tensor::cat(vec![self.states.clone(); k], 0),
            keys:     Tensor::cat(vec![self.keys.clone(); k], 0),
            pad_mask: Tensor::cat(vec![self.pad_mask.clone(); k], 0),
            lengths:  self.lengths.iter().copied().cycle().take(k * self.lengths.len()).collect(),
        }
    }
}

/// [batch, frames] mask, true where `t >= length`
pub fn padding_mask<B: Backend>(lengths: &[usize], frames: usize, device: &B::Device) -> Tensor<B, 2, Bool> {
    let data: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..frames).map(move |t| t >= len))
        .collect();
    Tensor::<B, 2, Bool>::from_data(TensorData::new(data, [lengths.len(), frames]), device)
}

// ─── Decoder State ────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    pub hidden:  Tensor<B, 2>,
    pub context: Tensor<B, 2>,
}

impl<B: Backend> DecoderState<B> {
    /// Keep the rows named by `indices` (beam reordering)
    pub fn select(self, indices: Tensor<B, 1, Int>) -> Self {
        Self {
            hidden:  self.hidden.select(0, indices.clone()),
            context: self.context.select(0, indices),
        }
    }
}

// ─── Seq2Seq Head ─────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct Seq2SeqHead<B: Backend> {
    pub enc_in:      Linear<B>,
    pub enc_out:     Linear<B>,
    pub enc_dropout: Dropout,
    pub embedding:   Embedding<B>,
    pub cell:        GruCell<B>,
    pub attn_query:  Linear<B>,
    pub attn_key:    Linear<B>,
    pub attn_out:    Linear<B>,
    pub seq_lin:     Linear<B>,
    pub ctc_lin:     Linear<B>,
    pub emb_dim:     usize,
    pub enc_dim:     usize,
    pub dec_dim:     usize,
    pub attn_dim:    usize,
}

impl<B: Backend> Seq2SeqHead<B> {
    pub fn encode(&self, feats: Tensor<B, 3>, lengths: Vec<usize>) -> EncoderOutput<B> {
        let [_, frames, _] = feats.dims();
        let x      = self.enc_dropout.forward(gelu(self.enc_in.forward(feats)));
        let states = gelu(self.enc_out.forward(x));
        let keys   = self.attn_key.forward(states.clone());
        let lengths: Vec<usize> = lengths.into_iter().map(|l| l.min(frames)).collect();
        let pad_mask = padding_mask::<B>(&lengths, frames, &states.device());
        EncoderOutput { states, keys, pad_mask, lengths }
    }

    /// CTC log-probabilities [batch, frames, vocab]
    pub fn ctc_log_probs(&self, enc: &EncoderOutput<B>) -> Tensor<B, 3> {
        log_softmax(self.ctc_lin.forward(enc.states.clone()), 2)
    }

    pub fn initial_state(&self, batch: usize, device: &B::Device) -> DecoderState<B> {
        DecoderState {
            hidden:  Tensor::zeros([batch, self.dec_dim], device),
            context: Tensor::zeros([batch, self.enc_dim], device),
        }
    }

    /// One decoder step.
    /// tokens: [batch] → log-probs [batch, vocab] and the next state
    pub fn decode_step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state:  DecoderState<B>,
        enc:    &EncoderOutput<B>,
    ) -> (Tensor<B, 2>, DecoderState<B>) {
        let [batch] = tokens.dims();

        let emb = self.embedding
            .forward(tokens.unsqueeze_dim::<2>(1))
            .reshape([batch, self.emb_dim]);
        let hidden  = self.cell.forward(Tensor::cat(vec![emb, state.context], 1), state.hidden);
        let context = self.attend(hidden.clone(), enc);

        let out  = gelu(self.attn_out.forward(Tensor::cat(vec![hidden.clone(), context.clone()], 1)));
        let logp = log_softmax(self.seq_lin.forward(out), 1);
        (logp, DecoderState { hidden, context })
    }

    fn attend(&self, hidden: Tensor<B, 2>, enc: &EncoderOutput<B>) -> Tensor<B, 2> {
        let [batch, frames, _] = enc.keys.dims();
        let scale = 1.0 / (self.attn_dim as f64).sqrt();

        let query  = self.attn_query.forward(hidden).unsqueeze_dim::<3>(2); // [B, A, 1]
        let scores = enc.keys.clone()
            .matmul(query)
            .reshape([batch, frames])
            .mul_scalar(scale)
            .mask_fill(enc.pad_mask.clone(), MASKED_SCORE);
        let weights = softmax(scores, 1).unsqueeze_dim::<3>(1);             // [B, 1, T]
        weights.matmul(enc.states.clone()).reshape([batch, self.enc_dim])
    }

    /// Decoding fed with the reference `tokens_bos`: [batch, steps, vocab]
    pub fn forward_seq(&self, enc: &EncoderOutput<B>, tokens_bos: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, steps] = tokens_bos.dims();
        let mut state   = self.initial_state(batch, &tokens_bos.device());
        let mut outputs = Vec::with_capacity(steps);

        for u in 0..steps {
            let input = tokens_bos.clone().slice([0..batch, u..u + 1]).reshape([batch]);
            let (logp, next) = self.decode_step(input, state, enc);
            outputs.push(logp);
            state = next;
        }
        Tensor::stack(outputs, 1)
    }
}

// ─── Full Model ───────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct AsrModel<B: Backend> {
    pub extractor: FeatureExtractor<B>,
    pub head:      Seq2SeqHead<B>,
}

pub struct ModelOutputs<B: Backend> {
    pub encoder:  EncoderOutput<B>,
    pub seq_logp: Tensor<B, 3>,
    /// Present only while the CTC loss is part of the objective
    pub ctc_logp: Option<Tensor<B, 3>>,
}

impl<B: Backend> AsrModel<B> {
    pub fn encode(&self, wavs: Tensor<B, 2>, wav_lens: &[usize]) -> EncoderOutput<B> {
        let feats = self.extractor.forward(wavs);
        self.head.encode(feats, self.extractor.frame_lengths(wav_lens))
    }

    pub fn forward(&self, batch: &AsrBatch<B>, phase: LossPhase) -> ModelOutputs<B> {
        let encoder  = self.encode(batch.wavs.clone(), &batch.wav_lens);
        let seq_logp = self.head.forward_seq(&encoder, batch.tokens_bos.clone());
        let ctc_logp = phase.needs_ctc().then(|| self.head.ctc_log_probs(&encoder));
        ModelOutputs { encoder, seq_logp, ctc_logp }
    }

    pub fn save_record(&self, path: &Path) -> Result<()> {
        Recorder::<B>::record(&checkpoint_recorder(), self.clone().into_record(), path.to_path_buf())
            .with_context(|| format!("Failed to save model to '{}'", path.display()))
    }

    pub fn load_from(self, path: &Path, device: &B::Device) -> Result<Self> {
        let record = Recorder::<B>::load(&checkpoint_recorder(), path.to_path_buf(), device)
            .with_context(|| format!("Cannot load model from '{}'", path.display()))?;
        Ok(self.load_record(record))
    }
}
