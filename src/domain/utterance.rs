// ============================================================
// Layer 3 — Utterance Domain Type
// ============================================================
// One entry of a dataset manifest: an audio segment and the
// words sung or spoken in it. Plain data, no behaviour beyond
// small helpers.
//
// Manifest JSON shape (one object per utterance id):
//
//   "F01_0001": {
//       "wav":    "{data_root}/segmented/F01_0001.wav",
//       "words":  "i can see the light",
//       "length": 3.52,
//       "imu":    "{data_root}/imu/F01_0001.csv"     (optional)
//   }
//
// Reference: Rust Book §5 (Structs)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A labelled audio segment loaded from a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Unique utterance id (the manifest key)
    pub id: String,

    /// Path to the WAV file with `{data_root}` already resolved
    pub wav: PathBuf,

    /// Reference transcript, words separated by single spaces
    pub words: String,

    /// Duration in seconds, used for sorting
    pub length: f64,

    /// Optional IMU side channel; carried through, not consumed
    pub imu: Option<PathBuf>,
}

impl Utterance {
    pub fn new(
        id:     impl Into<String>,
        wav:    impl Into<PathBuf>,
        words:  impl Into<String>,
        length: f64,
    ) -> Self {
        Self {
            id:     id.into(),
            wav:    wav.into(),
            words:  words.into(),
            length,
            imu:    None,
        }
    }

    /// The reference split into words
    pub fn word_list(&self) -> Vec<String> {
        self.words.split_whitespace().map(str::to_string).collect()
    }
}
