// ============================================================
// Layer 5 — Evaluation Stage
// ============================================================
// Runs one VALID or TEST pass with a model on the inner
// (non-autodiff) backend:
//
//   reset metrics
//   for each batch:
//     forward (sequence branch only)
//     loss    → reported, never back-propagated
//     decode  → greedy on VALID, beam + LM on TEST
//     metrics ← (ids, predicted words, reference words)
//   summarize WER / CER
//
// The metric accumulator lives here and is reset at the start
// of every stage, so numbers never leak from one pass into the
// next.
//
// Reference: Burn Book §5 (model.valid(), inference)

use anyhow::{Context, Result};
use burn::prelude::*;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::data::batcher::AsrBatch;
use crate::domain::{error_rate::MetricAccumulator, stage::Stage};
use crate::infra::label_encoder::LabelEncoder;
use crate::ml::{
    decoder::DecoderSelector,
    lm::ExternalLm,
    loss::LossComposer,
    model::AsrModel,
};

/// Averages of one evaluation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSummary {
    pub loss:    f64,
    pub wer:     f64,
    pub cer:     f64,
    pub batches: usize,
}

pub struct Evaluator<B: Backend> {
    composer: LossComposer,
    decoder:  DecoderSelector,
    lm:       ExternalLm<B>,
    encoder:  LabelEncoder,
    metrics:  MetricAccumulator,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(composer: LossComposer, decoder: DecoderSelector, lm: ExternalLm<B>, encoder: LabelEncoder) -> Self {
        Self { composer, decoder, lm, encoder, metrics: MetricAccumulator::new() }
    }

    pub fn metrics(&self) -> &MetricAccumulator { &self.metrics }

    /// Score one batch; returns its sequence loss.
    pub fn evaluate_batch(
        &mut self,
        model: &AsrModel<B>,
        batch: &AsrBatch<B>,
        stage: Stage,
        epoch: usize,
    ) -> Result<f64> {
        let outputs = model.forward(batch, self.composer.phase(stage, epoch));
        let loss    = self.composer.compose(&outputs, batch, stage, epoch)?;

        let hyps = self.decoder.decode(&model.head, &outputs.encoder, stage, &self.lm)?;
        let predicted: Vec<Vec<String>> = hyps
            .iter()
            .map(|h| self.encoder.decode_words(&h.tokens))
            .collect();
        self.metrics.append(&batch.ids, &predicted, &batch.target_words())?;

        Ok(loss.into_scalar().elem::<f64>())
    }

    /// One full VALID or TEST pass.
    pub fn run_stage<I, E>(
        &mut self,
        model:   &AsrModel<B>,
        stage:   Stage,
        epoch:   usize,
        batches: I,
    ) -> Result<StageSummary>
    where
        I: IntoIterator<Item = Result<AsrBatch<B>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.metrics.reset();

        let mut loss_sum = 0.0f64;
        let mut count    = 0usize;
        for batch in batches {
            let batch = batch?;
            loss_sum += self.evaluate_batch(model, &batch, stage, epoch)?;
            count    += 1;
        }

        let summary = StageSummary {
            loss:    if count > 0 { loss_sum / count as f64 } else { f64::NAN },
            wer:     self.metrics.wer().with_context(|| format!("{stage} stage produced no utterances"))?,
            cer:     self.metrics.cer()?,
            batches: count,
        };
        tracing::debug!(%stage, epoch, ?summary, "Evaluation pass finished");
        Ok(summary)
    }

    /// Write the CER/WER report of the last pass to `path`.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Cannot create report '{}'", path.display()))?;
        let mut w = BufWriter::new(file);
        self.metrics
            .write_report(&mut w)
            .and_then(|_| w.flush())
            .with_context(|| format!("Cannot write report '{}'", path.display()))?;
        tracing::info!("Wrote error-rate report to '{}'", path.display());
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::BatchError;
    use crate::domain::curriculum::CurriculumConfig;
    use crate::ml::{
        decoder::SearchConfig,
        test_utils::{synthetic_batch, tiny_config, tiny_encoder, TestInner},
    };
    use std::fs;
    use tempfile::tempdir;

    fn evaluator() -> Evaluator<TestInner> {
        let encoder = tiny_encoder();
        Evaluator::new(
            LossComposer::new(CurriculumConfig::new(1, 0.5).unwrap(), 0, 0.1),
            DecoderSelector::new(SearchConfig {
                bos: 1, eos: 2, min_decode_ratio: 0.0, max_decode_ratio: 1.0,
                beam_size: 2, lm_weight: 0.0, length_normalization: true,
            }).unwrap(),
            ExternalLm::Disabled { vocab_size: encoder.len() },
            encoder,
        )
    }

    #[test]
    fn test_stage_resets_metrics() {
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batches = vec![
            synthetic_batch::<TestInner>(&encoder, &["ab", "ba"], 1, &device),
            synthetic_batch::<TestInner>(&encoder, &["a b"], 2, &device),
        ];

        let mut eval = evaluator();
        let first = eval
            .run_stage(&model, Stage::Valid, 1, batches.clone().into_iter().map(Ok::<_, BatchError>))
            .unwrap();
        assert_eq!(first.batches, 2);
        assert_eq!(eval.metrics().utterance_count(), 3);

        let second = eval
            .run_stage(&model, Stage::Valid, 1, batches.into_iter().map(Ok::<_, BatchError>))
            .unwrap();
        assert_eq!(eval.metrics().utterance_count(), 3);
        assert_eq!(first.wer, second.wer);
        assert!(first.loss.is_finite());
    }

    #[test]
    fn test_empty_stage_is_error() {
        let device = Default::default();
        let model  = tiny_config(6).init::<TestInner>(&device);
        let mut eval = evaluator();
        let none: Vec<Result<AsrBatch<TestInner>, BatchError>> = Vec::new();
        assert!(eval.run_stage(&model, Stage::Valid, 1, none).is_err());
    }

    #[test]
    fn test_batch_error_propagates() {
        let device = Default::default();
        let model  = tiny_config(6).init::<TestInner>(&device);
        let mut eval = evaluator();
        let bad: Vec<Result<AsrBatch<TestInner>, BatchError>> = vec![Err(BatchError("broken wav".into()))];
        assert!(eval.run_stage(&model, Stage::Test, 1, bad).is_err());
    }

    #[test]
    fn test_report_file() {
        let dir     = tempdir().unwrap();
        let device  = Default::default();
        let encoder = tiny_encoder();
        let model   = tiny_config(encoder.len()).init::<TestInner>(&device);
        let batch   = synthetic_batch::<TestInner>(&encoder, &["ab ba"], 3, &device);

        let mut eval = evaluator();
        eval.run_stage(&model, Stage::Test, 1, vec![Ok::<_, BatchError>(batch)]).unwrap();
        let path = dir.path().join("wer.txt");
        eval.write_report(&path).unwrap();

        let body = fs::read_to_string(path).unwrap();
        assert!(body.starts_with("%CER"));
        assert!(body.contains("%WER"));
        assert!(body.contains("utt0"));
    }
}
