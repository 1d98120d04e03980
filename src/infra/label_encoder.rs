// ============================================================
// Layer 6 — Label Encoder Store
// ============================================================
// Character-level label encoder shared by training, decoding
// and evaluation. The CTC blank, BOS and EOS labels sit at
// configured indices; every other index holds one character
// of the training transcripts, in first-occurrence order.
// When BOS and EOS share an index they share one label.
//
// The encoder is built from the training split on the first
// run and saved next to the checkpoints; later runs (resume,
// evaluate) load it so label ids stay stable:
//
//   save/label_encoder.txt
//     '<blank>' => 0
//     '<eos-bos>' => 1
//     'a' => 2
//     ' ' => 3
//     ...
//
// Reference: Rust Book §8 (Collections: HashMap)
//            Rust Book §9 (Error Handling)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

const BLANK_LABEL:   &str = "<blank>";
const BOS_LABEL:     &str = "<bos>";
const EOS_LABEL:     &str = "<eos>";
const BOS_EOS_LABEL: &str = "<eos-bos>";

/// Indices reserved for the special labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub blank: usize,
    pub bos:   usize,
    pub eos:   usize,
}

impl SpecialTokens {
    pub fn new(blank: usize, bos: usize, eos: usize) -> Result<Self> {
        if blank == bos || blank == eos {
            bail!("blank index {blank} must differ from bos ({bos}) and eos ({eos})");
        }
        Ok(Self { blank, bos, eos })
    }

    fn is_special(&self, idx: usize) -> bool {
        idx == self.blank || idx == self.bos || idx == self.eos
    }

    fn count(&self) -> usize {
        if self.bos == self.eos { 2 } else { 3 }
    }
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self { blank: 0, bos: 1, eos: 2 }
    }
}

// ─── LabelEncoder ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEncoder {
    labels:  Vec<String>,
    index:   HashMap<char, usize>,
    special: SpecialTokens,
}

impl LabelEncoder {
    /// Build an encoder from transcripts.
    pub fn build<'a>(
        texts:   impl IntoIterator<Item = &'a str>,
        special: SpecialTokens,
    ) -> Result<Self> {
        // ── Step 1: characters in first-occurrence order ──────────────────────
        let mut chars: Vec<char> = Vec::new();
        let mut seen:  HashMap<char, ()> = HashMap::new();
        for text in texts {
            for c in text.chars() {
                if seen.insert(c, ()).is_none() {
                    chars.push(c);
                }
            }
        }

        // ── Step 2: reserve the special slots ─────────────────────────────────
        let total = chars.len() + special.count();
        for (name, idx) in [("blank", special.blank), ("bos", special.bos), ("eos", special.eos)] {
            if idx >= total {
                bail!("{name} index {idx} is outside the label set of size {total}");
            }
        }

        // ── Step 3: fill the remaining slots with characters ──────────────────
        let mut chars  = chars.into_iter();
        let mut labels = Vec::with_capacity(total);
        for idx in 0..total {
            let label = if special.is_special(idx) {
                special_label(&special, idx).to_string()
            } else {
                match chars.next() {
                    Some(c) => c.to_string(),
                    None    => bail!("label slot {idx} left empty"),
                }
            };
            labels.push(label);
        }

        Self::from_labels(labels, special)
    }

    fn from_labels(labels: Vec<String>, special: SpecialTokens) -> Result<Self> {
        let mut index = HashMap::new();
        for (idx, label) in labels.iter().enumerate() {
            if special.is_special(idx) {
                continue;
            }
            let mut it = label.chars();
            match (it.next(), it.next()) {
                (Some(c), None) => {
                    if index.insert(c, idx).is_some() {
                        bail!("character {c:?} appears twice in the label set");
                    }
                }
                _ => bail!("label {idx} ('{label}') is not a single character"),
            }
        }
        Ok(Self { labels, index, special })
    }

    /// Encode a transcript character by character.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.index
                    .get(&c)
                    .copied()
                    .with_context(|| format!("character {c:?} is not in the label set"))
            })
            .collect()
    }

    /// Decode label ids to text, dropping special labels.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter(|&&id| !self.special.is_special(id))
            .filter_map(|&id| self.labels.get(id))
            .map(String::as_str)
            .collect()
    }

    /// Decode label ids straight to a word list
    pub fn decode_words(&self, ids: &[usize]) -> Vec<String> {
        self.decode(ids)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize { self.labels.len() }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    pub fn special(&self) -> SpecialTokens { self.special }

    // ─── Persistence ──────────────────────────────────────────────────────────

    pub fn save(&self, path: &Path) -> Result<()> {
        let body: String = self.labels
            .iter()
            .enumerate()
            .map(|(idx, label)| format!("'{label}' => {idx}\n"))
            .collect();
        fs::write(path, body)
            .with_context(|| format!("Cannot write label encoder to '{}'", path.display()))
    }

    pub fn load(path: &Path, special: SpecialTokens) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("Cannot read label encoder '{}'", path.display()))?;

        let mut slots: Vec<Option<String>> = Vec::new();
        for (n, line) in body.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (label, idx) = parse_line(line)
                .with_context(|| format!("{}:{}: malformed line", path.display(), n + 1))?;
            if slots.len() <= idx {
                slots.resize(idx + 1, None);
            }
            if slots[idx].replace(label).is_some() {
                bail!("{}: index {} assigned twice", path.display(), idx);
            }
        }

        let labels = slots
            .into_iter()
            .enumerate()
            .map(|(idx, s)| s.with_context(|| format!("index {idx} missing from label encoder")))
            .collect::<Result<Vec<_>>>()?;

        for idx in [special.blank, special.bos, special.eos] {
            let expected = special_label(&special, idx);
            if labels.get(idx).map(String::as_str) != Some(expected) {
                bail!(
                    "'{}' does not hold '{}' at index {}; was it built with other special indices?",
                    path.display(), expected, idx
                );
            }
        }

        Self::from_labels(labels, special)
    }
}

fn special_label(special: &SpecialTokens, idx: usize) -> &'static str {
    if idx == special.blank {
        BLANK_LABEL
    } else if special.bos == special.eos {
        BOS_EOS_LABEL
    } else if idx == special.bos {
        BOS_LABEL
    } else {
        EOS_LABEL
    }
}

fn parse_line(line: &str) -> Option<(String, usize)> {
    let (quoted, idx) = line.rsplit_once(" => ")?;
    let label = quoted.strip_prefix('\'')?.strip_suffix('\'')?;
    Some((label.to_string(), idx.trim().parse().ok()?))
}

// ─── Store ────────────────────────────────────────────────────────────────────
/// Loads the saved encoder or builds and saves a new one.
pub struct LabelEncoderStore {
    dir: PathBuf,
}

impl LabelEncoderStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("label_encoder.txt")
    }

    pub fn load_or_create<'a>(
        &self,
        texts:   impl IntoIterator<Item = &'a str>,
        special: SpecialTokens,
    ) -> Result<LabelEncoder> {
        let path = self.path();
        if path.exists() {
            tracing::info!("Loading label encoder from '{}'", path.display());
            return LabelEncoder::load(&path, special);
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;
        let encoder = LabelEncoder::build(texts, special)?;
        encoder.save(&path)?;
        tracing::info!(
            "Built label encoder with {} labels, saved to '{}'",
            encoder.len(),
            path.display()
        );
        Ok(encoder)
    }

    pub fn load(&self, special: SpecialTokens) -> Result<LabelEncoder> {
        LabelEncoder::load(&self.path(), special)
    }
}
