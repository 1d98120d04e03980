// ============================================================
// Layer 5 — Test Fixtures
// ============================================================
// Shared by the ML layer tests: a tiny network on the NdArray
// backend and seeded synthetic batches.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::data::batcher::AsrBatch;
use crate::infra::label_encoder::{LabelEncoder, SpecialTokens};
use crate::ml::model::AsrModelConfig;

pub type TestInner    = NdArray;
pub type TestAutodiff = Autodiff<NdArray>;

/// Frames of 40 samples with a stride of 20
pub fn tiny_config(vocab_size: usize) -> AsrModelConfig {
    AsrModelConfig::new(vocab_size)
        .with_frame_size(40)
        .with_frame_stride(20)
        .with_feature_dim(8)
        .with_enc_dim(8)
        .with_emb_dim(4)
        .with_dec_dim(8)
        .with_attn_dim(4)
        .with_dropout(0.0)
}

/// blank 0, bos 1, eos 2, then 'a', 'b', ' '
pub fn tiny_encoder() -> LabelEncoder {
    LabelEncoder::build(["ab ba"], SpecialTokens::default()).unwrap()
}

/// One noise waveform per transcript, 200 + 60·i samples long
pub fn synthetic_batch<B: Backend>(
    encoder: &LabelEncoder,
    texts:   &[&str],
    seed:    u64,
    device:  &B::Device,
) -> AsrBatch<B> {
    let mut rng = StdRng::seed_from_u64(seed);
    let waveforms: Vec<Vec<f32>> = (0..texts.len())
        .map(|i| (0..200 + 60 * i).map(|_| rng.gen_range(-0.5..0.5)).collect())
        .collect();
    let targets = texts.iter().map(|t| encoder.encode(t).unwrap()).collect();
    AsrBatch::new(
        (0..texts.len()).map(|i| format!("utt{i}")).collect(),
        waveforms,
        targets,
        texts.iter().map(|t| t.to_string()).collect(),
        encoder.special(),
        40,
        device,
    )
    .unwrap()
}
