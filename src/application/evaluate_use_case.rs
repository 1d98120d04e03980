// ============================================================
// Layer 2 — Evaluate Use Case
// ============================================================
// Re-runs the TEST stage of a finished (or interrupted) run
// without training:
//
//   1. Reload train_config.json from <output>/save
//   2. Reload the label encoder saved by `train`
//   3. Load the best checkpoint by WER
//   4. Beam search (+ LM) over the test manifest
//   5. Write wer.txt and append to test_log.csv
//
// Decoding settings may be overridden for this pass only; the
// saved config is never rewritten.

use anyhow::{bail, Context, Result};
use burn::{backend::wgpu::WgpuDevice, data::dataloader::DataLoaderBuilder};
use std::path::{Path, PathBuf};

use crate::application::train_use_case::{load_split, EvalBackend, TrainConfig};
use crate::data::{batcher::AsrBatcher, dataset::UtteranceDataset, sorting::SortingStrategy};
use crate::domain::stage::Stage;
use crate::infra::{
    checkpoint::CheckpointManager,
    label_encoder::LabelEncoderStore,
    metrics::{MetricsLogger, TestRecord},
};
use crate::ml::{
    decoder::DecoderSelector,
    evaluator::Evaluator,
    lm::ExternalLm,
    supervisor::{load_best_model, BEST_BY},
};

/// Overrides applied on top of the saved configuration
#[derive(Debug, Clone, Default)]
pub struct EvaluateOverrides {
    pub test_json: Option<PathBuf>,
    pub beam_size: Option<usize>,
    pub lm_weight: Option<f64>,
    pub lm_path:   Option<PathBuf>,
}

pub struct EvaluateUseCase {
    config: TrainConfig,
}

impl EvaluateUseCase {
    /// Load the configuration saved by `train` in `output_folder`.
    pub fn new(output_folder: &Path, overrides: EvaluateOverrides) -> Result<Self> {
        let checkpoints = CheckpointManager::new(output_folder.join("save"))?;
        let mut config: TrainConfig = checkpoints.load_config()?;

        // the run may have been moved since it was trained
        config.output_folder = output_folder.to_path_buf();
        if let Some(v) = overrides.test_json { config.test_json = v; }
        if let Some(v) = overrides.beam_size { config.beam_size = v; }
        if let Some(v) = overrides.lm_weight { config.lm_weight = v; }
        if let Some(v) = overrides.lm_path   { config.lm_path = Some(v); }
        config.validate().context("Invalid evaluation configuration")?;

        Ok(Self { config })
    }

    pub fn execute(&self) -> Result<TestRecord> {
        let cfg    = &self.config;
        let device = WgpuDevice::default();

        let special = cfg.special_tokens()?;
        let encoder = LabelEncoderStore::new(cfg.save_folder()).load(special)?;

        let test = load_split(&cfg.test_json, &cfg.data_folder, SortingStrategy::Ascending)?;
        let test_dataset = UtteranceDataset::from_utterances(test, &encoder)?;

        let checkpoints = CheckpointManager::new(cfg.save_folder())?;
        let model = cfg.model_config(encoder.len()).init::<EvalBackend>(&device);
        let (model, loaded) = load_best_model(&checkpoints, BEST_BY, model, &device)?;
        let Some(epoch_loaded) = loaded else {
            bail!(
                "No checkpoint in '{}'. Make sure you have run 'train' before 'evaluate'.",
                checkpoints.dir().display()
            );
        };

        let lm = ExternalLm::<EvalBackend>::from_path(
            &cfg.lm_config(encoder.len()),
            cfg.effective_lm_path(),
            &device,
        )?;
        let mut evaluator = Evaluator::new(
            cfg.loss_composer()?,
            DecoderSelector::new(cfg.search_config())?,
            lm,
            encoder,
        );

        let loader = DataLoaderBuilder::new(AsrBatcher::<EvalBackend>::new(
            device, special, cfg.sample_rate, cfg.frame_size,
        ))
        .batch_size(cfg.test_batch_size)
        .num_workers(cfg.num_workers)
        .build(test_dataset);

        let summary = evaluator.run_stage(&model, Stage::Test, epoch_loaded, loader.iter())?;
        evaluator.write_report(&cfg.output_folder.join("wer.txt"))?;

        let record = TestRecord {
            epoch_loaded,
            test_loss: summary.loss,
            test_cer:  summary.cer,
            test_wer:  summary.wer,
        };
        MetricsLogger::new(&cfg.output_folder)?.log_test(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_run_is_reported() {
        let dir = tempdir().unwrap();
        let err = EvaluateUseCase::new(dir.path(), EvaluateOverrides::default())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("run 'train' before 'evaluate'"));
    }

    #[test]
    fn test_overrides_apply_on_saved_config() {
        let dir  = tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path().join("save")).unwrap();
        ckpt.save_config(&TrainConfig { output_folder: "elsewhere".into(), ..Default::default() }).unwrap();

        let overrides = EvaluateOverrides { beam_size: Some(3), lm_weight: Some(0.0), ..Default::default() };
        let uc = EvaluateUseCase::new(dir.path(), overrides).unwrap();
        assert_eq!(uc.config.beam_size, 3);
        assert_eq!(uc.config.lm_weight, 0.0);
        assert_eq!(uc.config.output_folder, dir.path());

        // bad override is rejected up front
        let overrides = EvaluateOverrides { beam_size: Some(0), ..Default::default() };
        assert!(EvaluateUseCase::new(dir.path(), overrides).is_err());
        assert!(fs::read_to_string(dir.path().join("save/train_config.json")).unwrap().contains("elsewhere"));
    }
}
