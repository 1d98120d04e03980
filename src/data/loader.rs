// ============================================================
// Layer 4 — Manifest Loader
// ============================================================
// Loads one dataset split from a JSON manifest. The manifest
// is a single object keyed by utterance id:
//
//   {
//     "F01_0001": { "wav": "{data_root}/F01_0001.wav",
//                   "words": "i can see", "length": 3.52 },
//     ...
//   }
//
// Every `{data_root}` placeholder in a path is replaced with
// the configured data folder. Loading fails on the first
// malformed entry, missing audio file or empty transcript:
// a training run never starts on a partially read split.
//
// Reference: serde_json crate documentation
//            Rust Book §9 (Error Handling)

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::domain::traits::UtteranceSource;
use crate::domain::utterance::Utterance;

/// Placeholder substituted with the data folder in manifest paths
pub const DATA_ROOT_PLACEHOLDER: &str = "{data_root}";

/// One raw manifest entry, before path resolution
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    wav:    String,
    words:  String,
    length: f64,
    #[serde(default)]
    imu:    Option<String>,
}

/// Loads utterances from a JSON manifest file.
/// Implements the UtteranceSource trait from Layer 3.
pub struct JsonManifest {
    /// Path to the manifest file
    path: PathBuf,

    /// Replacement for `{data_root}`
    data_root: PathBuf,

    /// When false, WAV paths are not checked for existence
    check_audio: bool,
}

impl JsonManifest {
    pub fn new(path: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            path:        path.into(),
            data_root:   data_root.into(),
            check_audio: true,
        }
    }

    /// Skip the WAV existence check (used when paths point at
    /// storage that is mounted later, and in tests).
    pub fn without_audio_check(mut self) -> Self {
        self.check_audio = false;
        self
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let root = self.data_root.to_string_lossy();
        PathBuf::from(raw.replace(DATA_ROOT_PLACEHOLDER, &root))
    }

    fn convert(&self, id: String, entry: ManifestEntry) -> Result<Utterance> {
        if entry.words.trim().is_empty() {
            bail!("Utterance '{}' has an empty transcript", id);
        }
        if !entry.length.is_finite() || entry.length < 0.0 {
            bail!("Utterance '{}' has invalid length {}", id, entry.length);
        }

        let wav = self.resolve(&entry.wav);
        if self.check_audio && !wav.is_file() {
            bail!("Utterance '{}': audio file '{}' does not exist", id, wav.display());
        }

        let mut utt = Utterance::new(id, wav, entry.words.trim(), entry.length);
        utt.imu = entry.imu.as_deref().map(|p| self.resolve(p));
        Ok(utt)
    }
}

impl UtteranceSource for JsonManifest {
    fn load_all(&self) -> Result<Vec<Utterance>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Cannot read manifest '{}'", self.path.display()))?;

        let entries: BTreeMap<String, ManifestEntry> = serde_json::from_str(&text)
            .with_context(|| format!("Malformed manifest '{}'", self.path.display()))?;

        let utterances = entries
            .into_iter()
            .map(|(id, entry)| self.convert(id, entry))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid entry in manifest '{}'", self.path.display()))?;

        tracing::info!(
            "Loaded {} utterances from '{}'",
            utterances.len(),
            manifest_name(&self.path)
        );
        Ok(utterances)
    }
}

fn manifest_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("manifest")
        .to_string()
}
