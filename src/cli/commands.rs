// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands: `train` and `evaluate`
// and all their configurable flags.
//
// `train` starts from the defaults, or from a JSON file given
// with --hparams, and then applies any flag given on the
// command line on top.
//
// Reference: Rust Book §12 (Building a CLI Program)

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::{evaluate_use_case::EvaluateOverrides, train_use_case::TrainConfig};
use crate::data::sorting::SortingStrategy;

/// The two top-level subcommands available to the user
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the recognizer, then test the best checkpoint
    Train(TrainArgs),

    /// Re-run the test pass on the best checkpoint of a run
    Evaluate(EvaluateArgs),
}

/// All arguments for the `train` command.
/// Every flag is optional and overrides the hparams file.
#[derive(Args, Debug, Default)]
#[command(allow_negative_numbers = true)]
pub struct TrainArgs {
    /// JSON file with hyperparameters; missing keys take defaults
    #[arg(long)]
    pub hparams: Option<PathBuf>,

    /// Replaces `{data_root}` in manifest paths
    #[arg(long)]
    pub data_folder: Option<PathBuf>,

    #[arg(long)]
    pub train_json: Option<PathBuf>,

    #[arg(long)]
    pub valid_json: Option<PathBuf>,

    #[arg(long)]
    pub test_json: Option<PathBuf>,

    /// Logs, reports and the `save/` checkpoint folder go here
    #[arg(long)]
    pub output_folder: Option<PathBuf>,

    /// ascending, descending or random
    #[arg(long)]
    pub sorting: Option<SortingStrategy>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub number_of_epochs: Option<usize>,

    /// Epochs trained with the joint CTC + sequence loss
    #[arg(long)]
    pub number_of_ctc_epochs: Option<i64>,

    /// Weight of the CTC term while it is active
    #[arg(long)]
    pub ctc_weight: Option<f64>,

    #[arg(long)]
    pub lr_extractor: Option<f64>,

    #[arg(long)]
    pub lr_head: Option<f64>,

    #[arg(long)]
    pub beam_size: Option<usize>,

    #[arg(long)]
    pub lm_weight: Option<f64>,

    /// Record of a trained RNN language model
    #[arg(long)]
    pub lm_path: Option<PathBuf>,

    /// Record of a feature extractor from an earlier run
    #[arg(long)]
    pub pretrained_extractor: Option<PathBuf>,

    #[arg(long)]
    pub num_workers: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainArgs {
    /// Build the effective TrainConfig.
    /// The application layer never sees clap types.
    pub fn into_config(self) -> Result<TrainConfig> {
        let mut cfg = match &self.hparams {
            Some(path) => TrainConfig::from_file(path)?,
            None       => TrainConfig::default(),
        };

        if let Some(v) = self.data_folder          { cfg.data_folder = v; }
        if let Some(v) = self.train_json           { cfg.train_json = v; }
        if let Some(v) = self.valid_json           { cfg.valid_json = v; }
        if let Some(v) = self.test_json            { cfg.test_json = v; }
        if let Some(v) = self.output_folder        { cfg.output_folder = v; }
        if let Some(v) = self.sorting              { cfg.sorting = v; }
        if let Some(v) = self.batch_size           { cfg.batch_size = v; }
        if let Some(v) = self.number_of_epochs     { cfg.number_of_epochs = v; }
        if let Some(v) = self.number_of_ctc_epochs { cfg.number_of_ctc_epochs = v; }
        if let Some(v) = self.ctc_weight           { cfg.ctc_weight = v; }
        if let Some(v) = self.lr_extractor         { cfg.lr_extractor = v; }
        if let Some(v) = self.lr_head              { cfg.lr_head = v; }
        if let Some(v) = self.beam_size            { cfg.beam_size = v; }
        if let Some(v) = self.lm_weight            { cfg.lm_weight = v; }
        if let Some(v) = self.num_workers          { cfg.num_workers = v; }
        if let Some(v) = self.seed                 { cfg.seed = v; }
        if let Some(p) = self.lm_path { cfg.lm_path = Some(p); }
        if let Some(p) = self.pretrained_extractor { cfg.pretrained_extractor = Some(p); }

        Ok(cfg)
    }
}

/// All arguments for the `evaluate` command
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Output folder of a `train` run
    #[arg(long, default_value = "results")]
    pub output_folder: PathBuf,

    /// Evaluate on another manifest than the one trained with
    #[arg(long)]
    pub test_json: Option<PathBuf>,

    #[arg(long)]
    pub beam_size: Option<usize>,

    #[arg(long)]
    pub lm_weight: Option<f64>,

    #[arg(long)]
    pub lm_path: Option<PathBuf>,
}

impl From<&EvaluateArgs> for EvaluateOverrides {
    fn from(a: &EvaluateArgs) -> Self {
        EvaluateOverrides {
            test_json: a.test_json.clone(),
            beam_size: a.beam_size,
            lm_weight: a.lm_weight,
            lm_path:   a.lm_path.clone(),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_flags_override_hparams_file() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        fs::write(&path, r#"{ "number_of_epochs": 20, "beam_size": 4 }"#).unwrap();

        let args = TrainArgs {
            hparams: Some(path),
            number_of_epochs: Some(2),
            sorting: Some(SortingStrategy::Random),
            ..Default::default()
        };
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.number_of_epochs, 2);
        assert_eq!(cfg.beam_size, 4);
        assert_eq!(cfg.sorting, SortingStrategy::Random);
    }

    #[test]
    fn test_parse_train_command() {
        let cli = Cli::try_parse_from([
            "hybrid-asr-trainer", "train",
            "--number-of-ctc-epochs", "-1",
            "--sorting", "descending",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        assert_eq!(args.number_of_ctc_epochs, Some(-1));
        assert_eq!(args.sorting, Some(SortingStrategy::Descending));
        // parsed, but rejected by validation
        assert!(args.into_config().unwrap().validate().is_err());
    }

    #[test]
    fn test_unknown_sorting_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["hybrid-asr-trainer", "train", "--sorting", "shuffled"]).is_err());
    }
}
