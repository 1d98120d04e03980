// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer loads utterances through this trait
// and never sees the manifest format behind it:
//
//   - JsonManifest      → reads an id-keyed JSON manifest
//   - (tests) in-memory Vec<Utterance>
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use crate::domain::utterance::Utterance;

// ─── UtteranceSource ──────────────────────────────────────────────────────────
/// Any component that can produce the labelled utterances of one split.
pub trait UtteranceSource {
    /// Load every utterance of this source.
    /// Fails on the first malformed entry; never returns a partial list.
    fn load_all(&self) -> Result<Vec<Utterance>>;
}

impl UtteranceSource for Vec<Utterance> {
    fn load_all(&self) -> Result<Vec<Utterance>> {
        Ok(self.clone())
    }
}
