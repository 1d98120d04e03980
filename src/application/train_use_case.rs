// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Validate config, create output folders (Layer 6 - infra)
//   Step 2: Load the three manifests           (Layer 4 - data)
//   Step 3: Build / load the label encoder     (Layer 6 - infra)
//   Step 4: Sort utterances, build datasets    (Layer 4 - data)
//   Step 5: Save config                        (Layer 6 - infra)
//   Step 6: Build model, LM, optimizers        (Layer 5 - ml)
//   Step 7: Recover the latest checkpoint      (Layer 5 - ml)
//   Step 8: Fit, then test the best checkpoint (Layer 5 - ml)
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::{bail, Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    data::dataloader::{DataLoader, DataLoaderBuilder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::data::{
    batcher::{AsrBatch, AsrBatcher, BatchError, BucketBatcher},
    bucketing::DynamicBatching,
    dataset::UtteranceDataset,
    loader::JsonManifest,
    sorting::SortingStrategy,
};
use crate::domain::{curriculum::CurriculumConfig, traits::UtteranceSource, utterance::Utterance};
use crate::infra::{
    checkpoint::{CheckpointManager, KeepPolicy},
    label_encoder::{LabelEncoderStore, SpecialTokens},
    metrics::{MetricsLogger, TestRecord},
};
use crate::ml::{
    decoder::{DecoderSelector, SearchConfig},
    evaluator::Evaluator,
    lm::{ExternalLm, RnnLmConfig},
    loss::LossComposer,
    model::AsrModelConfig,
    optim::{adam_pair, NewBobConfig, OptimSettings},
    supervisor::{Supervisor, SupervisorParts, BEST_BY},
};

pub type TrainBackend = Autodiff<Wgpu>;
pub type EvalBackend  = Wgpu;

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run.
// Serialisable so it can be saved next to the checkpoints and
// reloaded by `evaluate`. Missing keys take their default,
// unknown keys are rejected so a typo never goes unnoticed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    // ── data ──
    pub data_folder:     PathBuf,
    pub train_json:      PathBuf,
    pub valid_json:      PathBuf,
    pub test_json:       PathBuf,
    pub output_folder:   PathBuf,
    pub sorting:         SortingStrategy,
    pub sample_rate:     u32,
    pub batch_size:      usize,
    pub test_batch_size: usize,
    pub num_workers:     usize,
    pub seed:            u64,
    /// Size train and valid batches by duration instead of count
    pub dynamic_batching:      bool,
    pub dynamic_batch_sampler: DynamicBatching,

    // ── curriculum ──
    pub number_of_epochs:     usize,
    /// Signed so a negative value reaches validation instead of
    /// failing as a parse error
    pub number_of_ctc_epochs: i64,
    pub ctc_weight:           f64,
    pub label_smoothing:      f64,

    // ── optimisation ──
    pub lr_extractor:                    f64,
    pub lr_head:                         f64,
    pub annealing_factor_extractor:      f64,
    pub annealing_factor_head:           f64,
    pub improvement_threshold_extractor: f64,
    pub improvement_threshold_head:      f64,
    pub patient_extractor:               usize,
    pub patient_head:                    usize,
    /// 0 disables gradient clipping
    pub max_grad_norm:                   f64,
    pub loss_explosion_threshold:        f64,

    // ── decoding ──
    pub beam_size:            usize,
    pub lm_weight:            f64,
    pub min_decode_ratio:     f64,
    pub max_decode_ratio:     f64,
    pub length_normalization: bool,

    // ── labels ──
    pub blank_index: usize,
    pub bos_index:   usize,
    pub eos_index:   usize,

    // ── network ──
    pub frame_size:   usize,
    pub frame_stride: usize,
    pub feature_dim:  usize,
    pub enc_dim:      usize,
    pub emb_dim:      usize,
    pub dec_dim:      usize,
    pub attn_dim:     usize,
    pub dropout:      f64,
    pub pretrained_extractor: Option<PathBuf>,

    // ── language model ──
    pub lm_path:       Option<PathBuf>,
    pub lm_emb_dim:    usize,
    pub lm_hidden_dim: usize,

    // ── checkpoints ──
    pub num_to_keep: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_folder:     PathBuf::from("data"),
            train_json:      PathBuf::from("data/train.json"),
            valid_json:      PathBuf::from("data/valid.json"),
            test_json:       PathBuf::from("data/test.json"),
            output_folder:   PathBuf::from("results"),
            sorting:         SortingStrategy::Ascending,
            sample_rate:     16_000,
            batch_size:      8,
            test_batch_size: 8,
            num_workers:     1,
            seed:            1234,
            dynamic_batching:      false,
            dynamic_batch_sampler: DynamicBatching::default(),

            number_of_epochs:     10,
            number_of_ctc_epochs: 5,
            ctc_weight:           0.3,
            label_smoothing:      0.1,

            lr_extractor:                    1e-4,
            lr_head:                         1e-3,
            annealing_factor_extractor:      0.9,
            annealing_factor_head:           0.8,
            improvement_threshold_extractor: 0.0025,
            improvement_threshold_head:      0.0025,
            patient_extractor:               0,
            patient_head:                    0,
            max_grad_norm:                   5.0,
            loss_explosion_threshold:        1e5,

            beam_size:            10,
            lm_weight:            0.5,
            min_decode_ratio:     0.0,
            max_decode_ratio:     1.0,
            length_normalization: true,

            blank_index: 0,
            bos_index:   1,
            eos_index:   2,

            frame_size:   400,
            frame_stride: 320,
            feature_dim:  256,
            enc_dim:      256,
            emb_dim:      128,
            dec_dim:      256,
            attn_dim:     128,
            dropout:      0.15,
            pretrained_extractor: None,

            lm_path:       None,
            lm_emb_dim:    128,
            lm_hidden_dim: 256,

            num_to_keep: 1,
        }
    }
}

impl TrainConfig {
    /// Read a JSON hyperparameter file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read hparams '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid hparams '{}'", path.display()))
    }

    /// Reject every value that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        self.curriculum()?;
        self.special_tokens()?;
        self.optim_settings().validate()?;
        DecoderSelector::new(self.search_config())?;

        if self.batch_size == 0 || self.test_batch_size == 0 {
            bail!("batch sizes must be > 0");
        }
        if self.sample_rate == 0 {
            bail!("sample_rate must be > 0");
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            bail!("label_smoothing must lie in [0, 1), got {}", self.label_smoothing);
        }
        if self.frame_size == 0 || self.frame_stride == 0 {
            bail!("frame_size and frame_stride must be > 0");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must lie in [0, 1), got {}", self.dropout);
        }
        if self.lm_weight < 0.0 || !self.lm_weight.is_finite() {
            bail!("lm_weight must be >= 0, got {}", self.lm_weight);
        }
        if self.num_to_keep == 0 {
            bail!("num_to_keep must be >= 1");
        }
        if self.dynamic_batching {
            self.dynamic_batch_sampler.validate().context("dynamic_batch_sampler")?;
        }
        Ok(())
    }

    /// Checkpoints, label encoder and the saved config live here
    pub fn save_folder(&self) -> PathBuf {
        self.output_folder.join("save")
    }

    pub fn special_tokens(&self) -> Result<SpecialTokens> {
        SpecialTokens::new(self.blank_index, self.bos_index, self.eos_index)
    }

    pub fn curriculum(&self) -> Result<CurriculumConfig> {
        CurriculumConfig::new(self.number_of_ctc_epochs, self.ctc_weight)
    }

    pub fn loss_composer(&self) -> Result<LossComposer> {
        Ok(LossComposer::new(self.curriculum()?, self.blank_index, self.label_smoothing))
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            bos:                  self.bos_index,
            eos:                  self.eos_index,
            min_decode_ratio:     self.min_decode_ratio,
            max_decode_ratio:     self.max_decode_ratio,
            beam_size:            self.beam_size,
            lm_weight:            self.lm_weight,
            length_normalization: self.length_normalization,
        }
    }

    pub fn optim_settings(&self) -> OptimSettings {
        OptimSettings {
            extractor: NewBobConfig {
                initial_lr:            self.lr_extractor,
                annealing_factor:      self.annealing_factor_extractor,
                improvement_threshold: self.improvement_threshold_extractor,
                patient:               self.patient_extractor,
            },
            head: NewBobConfig {
                initial_lr:            self.lr_head,
                annealing_factor:      self.annealing_factor_head,
                improvement_threshold: self.improvement_threshold_head,
                patient:               self.patient_head,
            },
            max_grad_norm:            self.max_grad_norm,
            loss_explosion_threshold: self.loss_explosion_threshold,
        }
    }

    pub fn model_config(&self, vocab_size: usize) -> AsrModelConfig {
        AsrModelConfig::new(vocab_size)
            .with_frame_size(self.frame_size)
            .with_frame_stride(self.frame_stride)
            .with_feature_dim(self.feature_dim)
            .with_enc_dim(self.enc_dim)
            .with_emb_dim(self.emb_dim)
            .with_dec_dim(self.dec_dim)
            .with_attn_dim(self.attn_dim)
            .with_dropout(self.dropout)
    }

    pub fn lm_config(&self, vocab_size: usize) -> RnnLmConfig {
        RnnLmConfig::new(vocab_size)
            .with_emb_dim(self.lm_emb_dim)
            .with_hidden_dim(self.lm_hidden_dim)
    }

    /// LM weight 0 switches the LM off even when a path is set
    pub fn effective_lm_path(&self) -> Option<&Path> {
        self.lm_path.as_deref().filter(|_| self.lm_weight > 0.0)
    }

    /// Fixed-size batches, or duration buckets when dynamic
    /// batching is on.
    fn loader<B: Backend>(
        &self,
        batcher: AsrBatcher<B>,
        dataset: UtteranceDataset,
        shuffle: bool,
    ) -> Arc<dyn DataLoader<Result<AsrBatch<B>, BatchError>>> {
        if self.dynamic_batching {
            let sampler = &self.dynamic_batch_sampler;
            let mut builder = DataLoaderBuilder::new(BucketBatcher(batcher))
                .batch_size(1)
                .num_workers(self.num_workers);
            if sampler.batch_ordering.shuffles() {
                builder = builder.shuffle(self.seed);
            }
            return builder.build(dataset.bucketed(sampler, self.seed));
        }

        let mut builder = DataLoaderBuilder::new(batcher)
            .batch_size(self.batch_size)
            .num_workers(self.num_workers);
        if shuffle {
            builder = builder.shuffle(self.seed);
        }
        builder.build(dataset)
    }
}

/// Load a manifest and sort it.
pub(crate) fn load_split(
    manifest: &Path,
    data_folder: &Path,
    sorting: SortingStrategy,
) -> Result<Vec<Utterance>> {
    let mut utterances = JsonManifest::new(manifest, data_folder).load_all()?;
    if utterances.is_empty() {
        bail!("Manifest '{}' contains no utterances", manifest.display());
    }
    sorting.arrange(&mut utterances);
    Ok(utterances)
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
// Owns the config and runs the full training pipeline.
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Train, then evaluate the best checkpoint on the test split.
    pub fn execute(&self) -> Result<TestRecord> {
        let cfg = &self.config;

        // ── Step 1: Validate and prepare folders ──────────────────────────────
        cfg.validate().context("Invalid training configuration")?;
        let save_folder = cfg.save_folder();
        fs::create_dir_all(&save_folder)
            .with_context(|| format!("Cannot create '{}'", save_folder.display()))?;

        // ── Step 2: Load manifests ────────────────────────────────────────────
        // Valid and test are always sorted ascending.
        let train = load_split(&cfg.train_json, &cfg.data_folder, cfg.sorting)?;
        let valid = load_split(&cfg.valid_json, &cfg.data_folder, SortingStrategy::Ascending)?;
        let test  = load_split(&cfg.test_json, &cfg.data_folder, SortingStrategy::Ascending)?;
        tracing::info!(
            train = train.len(), valid = valid.len(), test = test.len(),
            sorting = %cfg.sorting,
            "Manifests loaded"
        );

        // ── Step 3: Label encoder ─────────────────────────────────────────────
        // Built from the training transcripts once, reloaded on resume.
        let special = cfg.special_tokens()?;
        let encoder = LabelEncoderStore::new(&save_folder)
            .load_or_create(train.iter().map(|u| u.words.as_str()), special)?;

        // ── Step 4: Datasets ──────────────────────────────────────────────────
        let train_dataset = UtteranceDataset::from_utterances(train, &encoder)?;
        let valid_dataset = UtteranceDataset::from_utterances(valid, &encoder)?;
        let test_dataset  = UtteranceDataset::from_utterances(test, &encoder)?;

        // ── Step 5: Save config for evaluation ────────────────────────────────
        let checkpoints = CheckpointManager::new(&save_folder)?;
        checkpoints.save_config(cfg)?;

        // ── Step 6: Model, LM, optimizers ─────────────────────────────────────
        let device = WgpuDevice::default();
        tracing::info!("Using WGPU device: {:?}", device);

        let mut model = cfg.model_config(encoder.len()).init::<TrainBackend>(&device);
        if let Some(path) = &cfg.pretrained_extractor {
            model.extractor = model.extractor.load_pretrained(path, &device)?;
        }
        let lm = ExternalLm::<EvalBackend>::from_path(
            &cfg.lm_config(encoder.len()),
            cfg.effective_lm_path(),
            &device,
        )?;

        let composer  = cfg.loss_composer()?;
        let evaluator = Evaluator::new(composer, DecoderSelector::new(cfg.search_config())?, lm, encoder);
        let parts = SupervisorParts {
            optim:       adam_pair::<TrainBackend>(&cfg.optim_settings())?,
            composer,
            evaluator,
            checkpoints,
            logger:      MetricsLogger::new(&cfg.output_folder)?,
            policy:      KeepPolicy::new(BEST_BY, cfg.num_to_keep),
            epochs:      cfg.number_of_epochs,
            device:      device.clone(),
        };

        // ── Step 7: Recover ───────────────────────────────────────────────────
        let (mut supervisor, model) = Supervisor::recover(parts, model)?;

        // ── Step 8: Data loaders, fit, test ───────────────────────────────────
        let min_samples = cfg.frame_size;
        let train_loader = cfg.loader(
            AsrBatcher::<TrainBackend>::new(device.clone(), special, cfg.sample_rate, min_samples),
            train_dataset,
            cfg.sorting.shuffles(),
        );
        let valid_loader = cfg.loader(
            AsrBatcher::<EvalBackend>::new(device.clone(), special, cfg.sample_rate, min_samples),
            valid_dataset,
            false,
        );

        let test_loader =
            DataLoaderBuilder::new(AsrBatcher::<EvalBackend>::new(device, special, cfg.sample_rate, min_samples))
                .batch_size(cfg.test_batch_size)
                .num_workers(cfg.num_workers)
                .build(test_dataset);

        let model = supervisor.fit(model, || train_loader.iter(), || valid_loader.iter())?;
        supervisor.test(model, test_loader.iter(), &cfg.output_folder.join("wer.txt"))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bucketing::BatchOrdering;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        fs::write(&path, r#"{ "number_of_epochs": 3, "sorting": "random" }"#).unwrap();

        let cfg = TrainConfig::from_file(&path).unwrap();
        assert_eq!(cfg.number_of_epochs, 3);
        assert_eq!(cfg.sorting, SortingStrategy::Random);
        assert_eq!(cfg.batch_size, TrainConfig::default().batch_size);
    }

    #[test]
    fn test_unknown_key_and_bad_sorting_rejected() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        fs::write(&path, r#"{ "numer_of_epochs": 3 }"#).unwrap();
        assert!(TrainConfig::from_file(&path).is_err());

        fs::write(&path, r#"{ "sorting": "by_speaker" }"#).unwrap();
        assert!(TrainConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let negative = TrainConfig { number_of_ctc_epochs: -1, ..Default::default() };
        assert!(negative.validate().is_err());

        let weight = TrainConfig { ctc_weight: 1.5, ..Default::default() };
        assert!(weight.validate().is_err());

        let beam = TrainConfig { beam_size: 0, ..Default::default() };
        assert!(beam.validate().is_err());

        let clash = TrainConfig { bos_index: 0, ..Default::default() };
        assert!(clash.validate().is_err());

        let lr = TrainConfig { lr_head: 0.0, ..Default::default() };
        assert!(lr.validate().is_err());
    }

    #[test]
    fn test_zero_lm_weight_disables_lm() {
        let cfg = TrainConfig { lm_path: Some("lm.mpk.gz".into()), lm_weight: 0.0, ..Default::default() };
        assert!(cfg.effective_lm_path().is_none());
        let cfg = TrainConfig { lm_weight: 0.5, ..cfg };
        assert!(cfg.effective_lm_path().is_some());
    }

    #[test]
    fn test_dynamic_batching_from_file() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        fs::write(&path, r#"{
            "dynamic_batching": true,
            "dynamic_batch_sampler": { "max_batch_len": 60.0, "batch_ordering": "descending" }
        }"#).unwrap();

        let cfg = TrainConfig::from_file(&path).unwrap();
        assert!(cfg.dynamic_batching);
        assert_eq!(cfg.dynamic_batch_sampler.max_batch_len, 60.0);
        assert_eq!(cfg.dynamic_batch_sampler.batch_ordering, BatchOrdering::Descending);
        assert_eq!(cfg.dynamic_batch_sampler.num_buckets, DynamicBatching::default().num_buckets);
        cfg.validate().unwrap();

        fs::write(&path, r#"{ "dynamic_batch_sampler": { "batch_ordering": "sideways" } }"#).unwrap();
        assert!(TrainConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_bad_sampler_only_matters_when_enabled() {
        let sampler = DynamicBatching { num_buckets: 0, ..Default::default() };
        let off = TrainConfig { dynamic_batch_sampler: sampler, ..Default::default() };
        assert!(off.validate().is_ok());
        let on = TrainConfig { dynamic_batching: true, ..off };
        assert!(on.validate().is_err());
    }

    #[test]
    fn test_config_round_trip_through_checkpoint_dir() {
        let dir = tempdir().unwrap();
        let ckpt = CheckpointManager::new(dir.path()).unwrap();
        let cfg = TrainConfig { beam_size: 4, sorting: SortingStrategy::Descending, ..Default::default() };
        ckpt.save_config(&cfg).unwrap();
        let back: TrainConfig = ckpt.load_config().unwrap();
        assert_eq!(back, cfg);
    }
}
