// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`    — trains the recognizer from JSON manifests,
//                   resuming from the latest checkpoint, then
//                   tests the best one
//   2. `evaluate` — re-runs the test pass of a finished run
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvaluateArgs, TrainArgs};

use crate::infra::metrics::TestRecord;

#[derive(Parser, Debug)]
#[command(
    name = "hybrid-asr-trainer",
    version,
    about = "Train a hybrid CTC/attention speech recognizer and score it by WER/CER."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)    => run_train(args),
            Commands::Evaluate(args) => run_evaluate(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let cfg = args.into_config()?;
    tracing::info!("Training with output folder '{}'", cfg.output_folder.display());

    let record = TrainUseCase::new(cfg).execute()?;
    print_record("Training complete.", &record);
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    use crate::application::evaluate_use_case::EvaluateUseCase;

    let record = EvaluateUseCase::new(&args.output_folder, (&args).into())?.execute()?;
    print_record("Evaluation complete.", &record);
    Ok(())
}

fn print_record(title: &str, r: &TestRecord) {
    println!(
        "{title} Checkpoint of epoch {} | test_loss={:.4} | CER={:.2}% | WER={:.2}%",
        r.epoch_loaded, r.test_loss, r.test_cer, r.test_wer,
    );
}
