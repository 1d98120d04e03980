// ============================================================
// Layer 6 — Training Log
// ============================================================
// Records one row per validation pass to train_log.csv and one
// row per test pass to test_log.csv. Every row is also emitted
// as a structured tracing event, so the same numbers show up in
// the console log.
//
// Columns of train_log.csv:
//   epoch         — completed epoch the row belongs to
//   lr_extractor  — learning rates used during that epoch
//   lr_head
//   train_loss    — mean over applied (not skipped) steps
//   valid_loss    — mean sequence loss on the valid split
//   valid_cer     — character error rate, %
//   valid_wer     — word error rate, %
//   skipped_steps — steps dropped for a non-finite or huge loss
//                   (cumulative over the run)
//
// Example:
//   epoch,lr_extractor,lr_head,train_loss,valid_loss,valid_cer,valid_wer,skipped_steps
//   1,0.000100,0.900000,3.124500,2.889200,61.230000,98.120000,0
//
// Both files are opened in append mode, so a resumed run keeps
// adding to the log of the interrupted one.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

const TRAIN_HEADER: &str =
    "epoch,lr_extractor,lr_head,train_loss,valid_loss,valid_cer,valid_wer,skipped_steps";
const TEST_HEADER: &str = "epoch_loaded,test_loss,test_cer,test_wer";

/// One row of train_log.csv
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch:         usize,
    pub lr_extractor:  f64,
    pub lr_head:       f64,
    pub train_loss:    f64,
    pub valid_loss:    f64,
    pub valid_cer:     f64,
    pub valid_wer:     f64,
    pub skipped_steps: usize,
}

/// One row of test_log.csv
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    /// Epoch counter stored in the evaluated checkpoint
    pub epoch_loaded: usize,
    pub test_loss:    f64,
    pub test_cer:     f64,
    pub test_wer:     f64,
}

pub struct MetricsLogger {
    train_csv: PathBuf,
    test_csv:  PathBuf,
}

impl MetricsLogger {
    /// Create the logger, writing CSV headers for new files.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create '{}'", dir.display()))?;

        let train_csv = dir.join("train_log.csv");
        let test_csv  = dir.join("test_log.csv");
        ensure_header(&train_csv, TRAIN_HEADER)?;
        ensure_header(&test_csv, TEST_HEADER)?;

        Ok(Self { train_csv, test_csv })
    }

    pub fn log_epoch(&self, r: &EpochRecord) -> Result<()> {
        append_line(
            &self.train_csv,
            &format!(
                "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{}",
                r.epoch, r.lr_extractor, r.lr_head, r.train_loss,
                r.valid_loss, r.valid_cer, r.valid_wer, r.skipped_steps,
            ),
        )?;

        tracing::info!(
            epoch         = r.epoch,
            lr_extractor  = r.lr_extractor,
            lr_head       = r.lr_head,
            train_loss    = r.train_loss,
            valid_loss    = r.valid_loss,
            valid_cer     = r.valid_cer,
            valid_wer     = r.valid_wer,
            skipped_steps = r.skipped_steps,
            "Epoch {} finished", r.epoch
        );
        Ok(())
    }

    pub fn log_test(&self, r: &TestRecord) -> Result<()> {
        append_line(
            &self.test_csv,
            &format!("{},{:.6},{:.6},{:.6}", r.epoch_loaded, r.test_loss, r.test_cer, r.test_wer),
        )?;

        tracing::info!(
            epoch_loaded = r.epoch_loaded,
            test_loss    = r.test_loss,
            test_cer     = r.test_cer,
            test_wer     = r.test_wer,
            "Test pass finished"
        );
        Ok(())
    }

    pub fn train_csv(&self) -> &Path { &self.train_csv }

    pub fn test_csv(&self) -> &Path { &self.test_csv }
}

fn ensure_header(path: &Path, header: &str) -> Result<()> {
    if !path.exists() {
        let mut f = fs::File::create(path)
            .with_context(|| format!("Cannot create '{}'", path.display()))?;
        writeln!(f, "{header}")?;
        tracing::debug!("Created log '{}'", path.display());
    }
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open '{}'", path.display()))?;
    writeln!(f, "{line}").with_context(|| format!("Cannot write to '{}'", path.display()))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(epoch: usize, wer: f64) -> EpochRecord {
        EpochRecord {
            epoch, lr_extractor: 1e-4, lr_head: 0.9, train_loss: 2.5,
            valid_loss: 2.3, valid_cer: 20.0, valid_wer: wer, skipped_steps: 0,
        }
    }

    #[test]
    fn test_rows_are_appended_across_loggers() {
        let dir = tempdir().unwrap();
        MetricsLogger::new(dir.path()).unwrap().log_epoch(&record(1, 50.0)).unwrap();
        // a resumed run reopens the same file
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log_epoch(&record(2, 40.0)).unwrap();

        let body  = fs::read_to_string(logger.train_csv()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRAIN_HEADER);
        assert!(lines[2].starts_with("2,"));
        assert!(lines[2].ends_with(",40.000000,0"));
    }

    #[test]
    fn test_test_log() {
        let dir    = tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log_test(&TestRecord { epoch_loaded: 3, test_loss: 1.0, test_cer: 5.0, test_wer: 12.5 }).unwrap();
        let body = fs::read_to_string(logger.test_csv()).unwrap();
        assert_eq!(body.lines().nth(1), Some("3,1.000000,5.000000,12.500000"));
    }
}
