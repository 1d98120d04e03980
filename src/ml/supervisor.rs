// ============================================================
// Layer 5 — Training Supervisor
// ============================================================
// Drives the whole run:
//
//   recover newest saved epoch (model, optimizers, schedulers,
//                               epoch counter), even when it
//                               was not the best by WER
//   while the epoch counter is not exhausted:
//     TRAIN  for each batch:
//              forward → composed loss → backward
//              → gradient check → step both groups (or skip)
//              → zero gradients
//     VALID  model.valid() → Evaluator (greedy decoding)
//            anneal both learning rates on WER
//            log the epoch, save a checkpoint and keep only
//            the best ones by WER
//   TEST   load the best checkpoint by WER → Evaluator (beam
//          search + LM) → wer.txt and test_log.csv
//
// The counter advances once per completed epoch and is stored
// in every checkpoint, so a resumed run continues right after
// the last epoch that finished.
//
// Reference: Burn Book §5 (Training, custom training loops)

use anyhow::{Context, Result};
use burn::{module::AutodiffModule, optim::Optimizer, prelude::*, tensor::backend::AutodiffBackend};
use std::path::Path;

use crate::data::batcher::AsrBatch;
use crate::domain::stage::{EpochCounter, Stage};
use crate::infra::{
    checkpoint::{CheckpointManager, CheckpointMeta, KeepPolicy, Recoverable},
    metrics::{EpochRecord, MetricsLogger, TestRecord},
};
use crate::ml::{
    evaluator::Evaluator,
    loss::LossComposer,
    model::{AsrModel, FeatureExtractor, Seq2SeqHead},
    optim::OptimizerPair,
};

/// Record name of the model inside a checkpoint directory
const MODEL_RECORD: &str = "model";

/// Metric the checkpoints are ranked by, lower is better
pub const BEST_BY: &str = "WER";

/// What happened to one training step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied { loss: f64 },
    /// Gradients were dropped: the loss was non-finite or exploded
    Skipped { loss: f64 },
}

/// Everything a supervisor is built from.
pub struct SupervisorParts<B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    pub optim:       OptimizerPair<B, OE, OH>,
    pub composer:    LossComposer,
    pub evaluator:   Evaluator<B::InnerBackend>,
    pub checkpoints: CheckpointManager,
    pub logger:      MetricsLogger,
    pub policy:      KeepPolicy,
    pub epochs:      usize,
    pub device:      B::Device,
}

pub struct Supervisor<B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    optim:       OptimizerPair<B, OE, OH>,
    composer:    LossComposer,
    evaluator:   Evaluator<B::InnerBackend>,
    checkpoints: CheckpointManager,
    logger:      MetricsLogger,
    policy:      KeepPolicy,
    counter:     EpochCounter,
    device:      B::Device,
}

/// What goes into a checkpoint directory during training
struct TrainingSnapshot<'a, B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    model: &'a AsrModel<B>,
    optim: &'a OptimizerPair<B, OE, OH>,
}

impl<B, OE, OH> Recoverable for TrainingSnapshot<'_, B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    fn save_to(&self, dir: &Path) -> Result<()> {
        self.model.save_record(&dir.join(MODEL_RECORD))?;
        self.optim.save(dir)
    }
}

/// Load the checkpoint with the lowest `min_key` into `model`.
///
/// Returns the model untouched and `None` when no checkpoint
/// carries the key.
pub fn load_best_model<B: Backend>(
    checkpoints: &CheckpointManager,
    min_key:     &str,
    model:       AsrModel<B>,
    device:      &B::Device,
) -> Result<(AsrModel<B>, Option<usize>)> {
    let Some(best) = checkpoints.best(min_key)? else {
        return Ok((model, None));
    };
    tracing::info!(
        epoch = best.meta.epoch,
        metrics = ?best.meta.metrics,
        "Loading best checkpoint '{}'", best.dir.display()
    );
    let model = model.load_from(&best.dir.join(MODEL_RECORD), device)?;
    Ok((model, Some(best.meta.epoch)))
}

impl<B, OE, OH> Supervisor<B, OE, OH>
where
    B:  AutodiffBackend,
    OE: Optimizer<FeatureExtractor<B>, B>,
    OH: Optimizer<Seq2SeqHead<B>, B>,
{
    /// Build the supervisor and restore the newest saved epoch, if
    /// any, into it and into `model`.
    pub fn recover(
        parts: SupervisorParts<B, OE, OH>,
        model: AsrModel<B>,
    ) -> Result<(Self, AsrModel<B>)> {
        let SupervisorParts { mut optim, composer, evaluator, checkpoints, logger, policy, epochs, device } = parts;

        let (model, counter) = match checkpoints.resume_point()? {
            Some(ckpt) => {
                tracing::info!(
                    epoch = ckpt.meta.epoch,
                    "Resuming from checkpoint '{}'", ckpt.dir.display()
                );
                let model = model.load_from(&ckpt.dir.join(MODEL_RECORD), &device)?;
                optim = optim
                    .load(&ckpt.dir, &device)
                    .with_context(|| format!("Cannot restore optimizers from '{}'", ckpt.dir.display()))?;
                (model, EpochCounter::restore(ckpt.meta.epoch, epochs))
            }
            None => {
                tracing::info!("No checkpoint found, starting from scratch");
                (model, EpochCounter::new(epochs))
            }
        };

        let supervisor = Self { optim, composer, evaluator, checkpoints, logger, policy, counter, device };
        Ok((supervisor, model))
    }

    pub fn counter(&self) -> &EpochCounter { &self.counter }

    pub fn optim(&self) -> &OptimizerPair<B, OE, OH> { &self.optim }

    /// One training step on `batch`.
    pub fn fit_batch(
        &mut self,
        model: AsrModel<B>,
        batch: &AsrBatch<B>,
        epoch: usize,
    ) -> Result<(AsrModel<B>, StepOutcome)> {
        let outputs = model.forward(batch, self.composer.phase(Stage::Train, epoch));
        let loss    = self.composer.compose(&outputs, batch, Stage::Train, epoch)?;
        let value   = loss.clone().into_scalar().elem::<f64>();

        self.optim.backward(loss, &model)?;
        let result = if self.optim.gradients_valid(value, &model) {
            self.optim.step_all(model).map(|m| (m, StepOutcome::Applied { loss: value }))
        } else {
            Ok((model, StepOutcome::Skipped { loss: value }))
        };
        self.optim.zero_all();
        result
    }

    /// Train until the epoch counter is exhausted.
    ///
    /// `train` and `valid` are called once per epoch and must yield
    /// a fresh pass over their split each time.
    pub fn fit<FT, IT, TE, FV, IV, VE>(
        &mut self,
        mut model: AsrModel<B>,
        mut train: FT,
        mut valid: FV,
    ) -> Result<AsrModel<B>>
    where
        FT: FnMut() -> IT,
        IT: IntoIterator<Item = Result<AsrBatch<B>, TE>>,
        TE: std::error::Error + Send + Sync + 'static,
        FV: FnMut() -> IV,
        IV: IntoIterator<Item = Result<AsrBatch<B::InnerBackend>, VE>>,
        VE: std::error::Error + Send + Sync + 'static,
    {
        if self.counter.is_exhausted() {
            tracing::info!(
                completed = self.counter.completed(),
                "All {} epochs already completed", self.counter.limit()
            );
        }

        while let Some(epoch) = self.counter.next_epoch() {
            tracing::info!(
                phase = ?self.composer.phase(Stage::Train, epoch),
                "Epoch {}/{} started", epoch, self.counter.limit()
            );

            // ── TRAIN ─────────────────────────────────────────────────────────
            let mut loss_sum = 0.0f64;
            let mut applied  = 0usize;
            for batch in train() {
                let batch = batch?;
                let (next, outcome) = self.fit_batch(model, &batch, epoch)?;
                model = next;
                if let StepOutcome::Applied { loss } = outcome {
                    loss_sum += loss;
                    applied  += 1;
                }
            }
            let train_loss = if applied > 0 { loss_sum / applied as f64 } else { f64::NAN };

            // ── VALID ─────────────────────────────────────────────────────────
            let summary = self
                .evaluator
                .run_stage(&model.valid(), Stage::Valid, epoch, valid())?;
            self.counter.complete(epoch);

            // ── End of validation ─────────────────────────────────────────────
            let lr = self.optim.anneal(summary.wer);
            self.logger.log_epoch(&EpochRecord {
                epoch,
                lr_extractor:  lr.extractor.0,
                lr_head:       lr.head.0,
                train_loss,
                valid_loss:    summary.loss,
                valid_cer:     summary.cer,
                valid_wer:     summary.wer,
                skipped_steps: self.optim.skipped_steps(),
            })?;

            let meta = CheckpointMeta::new(
                self.counter.completed(),
                [(BEST_BY, summary.wer), ("CER", summary.cer)],
            );
            let snapshot = TrainingSnapshot { model: &model, optim: &self.optim };
            self.checkpoints.save_and_keep_only(&snapshot, meta, &self.policy)?;
        }

        tracing::info!("Training complete!");
        Ok(model)
    }

    /// Evaluate the best checkpoint on the test split.
    ///
    /// Falls back to `model` itself when nothing has been saved yet.
    pub fn test<I, E>(&mut self, model: AsrModel<B>, batches: I, report_path: &Path) -> Result<TestRecord>
    where
        I: IntoIterator<Item = Result<AsrBatch<B::InnerBackend>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (model, loaded) = load_best_model(&self.checkpoints, &self.policy.min_key, model, &self.device)?;
        let epoch_loaded = loaded.unwrap_or_else(|| {
            tracing::warn!("No checkpoint to load, testing the current model");
            self.counter.completed()
        });

        let summary = self
            .evaluator
            .run_stage(&model.valid(), Stage::Test, epoch_loaded, batches)?;
        self.evaluator.write_report(report_path)?;

        let record = TestRecord {
            epoch_loaded,
            test_loss: summary.loss,
            test_cer:  summary.cer,
            test_wer:  summary.wer,
        };
        self.logger.log_test(&record)?;
        Ok(record)
    }
}
