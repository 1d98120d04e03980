use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use std::path::PathBuf;

use crate::data::bucketing::DynamicBatching;
use crate::domain::utterance::Utterance;
use crate::infra::label_encoder::LabelEncoder;

/// One utterance with its transcript already encoded.
/// Audio is read later, by the batcher.
#[derive(Debug, Clone)]
pub struct UtteranceSample {
    pub id:     String,
    pub wav:    PathBuf,
    pub words:  String,
    pub tokens: Vec<usize>,
    /// Duration in seconds, from the manifest
    pub length: f64,
}

pub struct UtteranceDataset {
    samples: Vec<UtteranceSample>,
}

impl UtteranceDataset {
    /// Encode every transcript up front so an unknown character
    /// fails here, before the first batch.
    pub fn from_utterances(utterances: Vec<Utterance>, encoder: &LabelEncoder) -> Result<Self> {
        let samples = utterances
            .into_iter()
            .map(|u| {
                let tokens = encoder
                    .encode(&u.words)
                    .with_context(|| format!("Cannot encode transcript of '{}'", u.id))?;
                Ok(UtteranceSample { id: u.id, wav: u.wav, words: u.words, tokens, length: u.length })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { samples })
    }

    pub fn sample_count(&self) -> usize { self.samples.len() }

    /// Regroup the samples into duration-bucketed batches.
    pub fn bucketed(self, batching: &DynamicBatching, seed: u64) -> BucketedDataset {
        let lengths: Vec<f64> = self.samples.iter().map(|s| s.length).collect();
        let batches = batching
            .plan(&lengths, seed)
            .into_iter()
            .map(|batch| batch.into_iter().map(|i| self.samples[i].clone()).collect())
            .collect();
        BucketedDataset { batches }
    }
}

/// A dataset whose items are whole, pre-planned batches.
/// Load it with a batch size of 1.
pub struct BucketedDataset {
    batches: Vec<Vec<UtteranceSample>>,
}

impl Dataset<Vec<UtteranceSample>> for BucketedDataset {
    fn get(&self, index: usize) -> Option<Vec<UtteranceSample>> {
        self.batches.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

impl Dataset<UtteranceSample> for UtteranceDataset {
    fn get(&self, index: usize) -> Option<UtteranceSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
