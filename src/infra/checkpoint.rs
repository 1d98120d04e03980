// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves training snapshots and keeps only the best ones.
//
// What gets saved per checkpoint:
//   1. model.mpk.gz          — all learned parameters
//   2. extractor_opt.mpk.gz  — Adam state of the extractor group
//   3. head_opt.mpk.gz       — Adam state of the head group
//   4. schedulers.json       — both NewBob schedulers
//   5. CKPT.json             — epoch counter + monitored metrics
//
// Directory layout:
//   save/
//     CKPT_epoch003_1718000000000/
//       model.mpk.gz  extractor_opt.mpk.gz  head_opt.mpk.gz
//       schedulers.json  CKPT.json
//     RESUME/                      (only while the newest epoch
//       ...same files...            scored worse than the best)
//     label_encoder.txt
//     train_config.json
//
// Writes are atomic at directory level: everything goes into a
// hidden temporary directory, CKPT.json is written last and the
// directory is renamed into place. Only a checkpoint with a
// CKPT.json is ever listed, and older checkpoints are deleted
// only after the new one is in place.
//
// Keep policy (min_key = "WER", num_to_keep = n):
//   the checkpoints whose metric is <= the n-th smallest value
//   are kept, every strictly worse one is deleted. Ties at the
//   boundary are all kept.
//
// Resume point:
//   a run restarts from the newest saved epoch, not the best one.
//   When the newest checkpoint falls outside the keep policy it
//   is moved to RESUME/ instead of being deleted. RESUME/ is not
//   a ranked checkpoint: list() and best() never see it, and it
//   is dropped as soon as a newer checkpoint is kept.
//
// Records use NamedMpkGzFileRecorder with full precision so a
// save/load round trip reproduces every parameter bit for bit.
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use burn::record::{FullPrecisionSettings, NamedMpkGzFileRecorder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const META_FILE:   &str = "CKPT.json";
const CKPT_PREFIX: &str = "CKPT_";
const TMP_PREFIX:  &str = ".tmp_";
const RESUME_DIR:  &str = "RESUME";

pub type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// The recorder used for every record this crate writes
pub fn checkpoint_recorder() -> CheckpointRecorder {
    CheckpointRecorder::default()
}

/// Anything that can write its state into a checkpoint directory.
pub trait Recoverable {
    fn save_to(&self, dir: &Path) -> Result<()>;
}

/// Contents of CKPT.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Number of completed epochs at save time
    pub epoch: usize,

    /// Monitored metric values, e.g. {"WER": 23.5, "CER": 9.1}
    pub metrics: BTreeMap<String, f64>,

    /// Milliseconds since the Unix epoch
    pub saved_at_ms: u64,
}

impl CheckpointMeta {
    pub fn new<'a>(epoch: usize, metrics: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let saved_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            epoch,
            metrics: metrics.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            saved_at_ms,
        }
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub dir:  PathBuf,
    pub meta: CheckpointMeta,
}

#[derive(Debug, Clone)]
pub struct KeepPolicy {
    pub min_key:     String,
    pub num_to_keep: usize,
}

impl KeepPolicy {
    pub fn new(min_key: impl Into<String>, num_to_keep: usize) -> Self {
        Self { min_key: min_key.into(), num_to_keep: num_to_keep.max(1) }
    }
}

/// Manages saving, listing and pruning of checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create the manager, creating `dir` if needed and removing
    /// temporary directories left behind by an interrupted save.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let stale = path.is_dir()
                && path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(TMP_PREFIX));
            if stale {
                tracing::warn!("Removing incomplete checkpoint '{}'", path.display());
                fs::remove_dir_all(&path)
                    .with_context(|| format!("Cannot remove '{}'", path.display()))?;
            }
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    /// Write `snapshot` as a new checkpoint, then delete every
    /// checkpoint that the keep policy no longer covers.
    pub fn save_and_keep_only<R: Recoverable>(
        &self,
        snapshot: &R,
        meta:     CheckpointMeta,
        policy:   &KeepPolicy,
    ) -> Result<Checkpoint> {
        // ── Step 1: pick a fresh name ─────────────────────────────────────────
        let base = format!("{CKPT_PREFIX}epoch{:03}_{}", meta.epoch, meta.saved_at_ms);
        let mut name = base.clone();
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{base}_{n}");
            n += 1;
        }
        let tmp   = self.dir.join(format!("{TMP_PREFIX}{name}"));
        let final_dir = self.dir.join(&name);

        // ── Step 2: write everything into the temporary directory ─────────────
        fs::create_dir_all(&tmp)
            .with_context(|| format!("Cannot create '{}'", tmp.display()))?;
        snapshot.save_to(&tmp)?;
        let meta_path = tmp.join(META_FILE);
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Cannot write '{}'", meta_path.display()))?;

        // ── Step 3: publish ───────────────────────────────────────────────────
        fs::rename(&tmp, &final_dir)
            .with_context(|| format!("Cannot move checkpoint into '{}'", final_dir.display()))?;
        tracing::info!(
            epoch = meta.epoch,
            metrics = ?meta.metrics,
            "Saved checkpoint '{}'", name
        );

        // ── Step 4: prune ─────────────────────────────────────────────────────
        let kept = self.keep_only(policy, &final_dir)?;
        let dir  = if kept { final_dir } else { self.dir.join(RESUME_DIR) };
        Ok(Checkpoint { dir, meta })
    }

    /// Every complete checkpoint, oldest first
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot read '{}'", self.dir.display()))?
        {
            let dir = entry?.path();
            let is_ckpt = dir.is_dir()
                && dir.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(CKPT_PREFIX));
            let meta_path = dir.join(META_FILE);
            if !is_ckpt || !meta_path.is_file() {
                continue;
            }
            found.push(Checkpoint { meta: read_meta(&meta_path)?, dir });
        }
        found.sort_by_key(|c| (c.meta.epoch, c.meta.saved_at_ms));
        Ok(found)
    }

    /// The most recently completed epoch's ranked checkpoint
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.pop())
    }

    /// Where a restarted run picks up: the newest saved epoch,
    /// whether it was kept by the policy or parked in RESUME/.
    pub fn resume_point(&self) -> Result<Option<Checkpoint>> {
        let latest = self.latest()?;
        let resume = self.dir.join(RESUME_DIR);
        let meta_path = resume.join(META_FILE);
        if !meta_path.is_file() {
            return Ok(latest);
        }
        let parked = Checkpoint { meta: read_meta(&meta_path)?, dir: resume };
        let newer = match latest {
            Some(l) if (l.meta.epoch, l.meta.saved_at_ms) >= (parked.meta.epoch, parked.meta.saved_at_ms) => l,
            _ => parked,
        };
        Ok(Some(newer))
    }

    /// The checkpoint with the smallest `min_key`; the later one on ties
    pub fn best(&self, min_key: &str) -> Result<Option<Checkpoint>> {
        let best = self
            .list()?
            .into_iter()
            .filter_map(|c| c.meta.metric(min_key).map(|m| (m, c)))
            .reduce(|best, cur| if cur.0.total_cmp(&best.0) != Ordering::Greater { cur } else { best })
            .map(|(_, c)| c);
        Ok(best)
    }

    /// Apply the keep policy. Returns false when `newest` fell
    /// outside it and was parked as the resume point.
    fn keep_only(&self, policy: &KeepPolicy, newest: &Path) -> Result<bool> {
        let all = self.list()?;

        let mut values: Vec<f64> = all
            .iter()
            .filter_map(|c| c.meta.metric(&policy.min_key))
            .collect();
        values.sort_by(f64::total_cmp);
        let cutoff = values.get(policy.num_to_keep.min(values.len()).saturating_sub(1)).copied();

        let resume = self.dir.join(RESUME_DIR);
        let mut kept = true;
        for ckpt in all {
            // checkpoints without the key are never touched
            let (Some(value), Some(cutoff)) = (ckpt.meta.metric(&policy.min_key), cutoff) else { continue };
            if value.total_cmp(&cutoff) != Ordering::Greater {
                continue;
            }
            if ckpt.dir == newest {
                remove_if_present(&resume)?;
                fs::rename(&ckpt.dir, &resume)
                    .with_context(|| format!("Cannot move '{}' to '{}'", ckpt.dir.display(), resume.display()))?;
                tracing::debug!(
                    "Parked checkpoint '{}' as resume point ({}={})",
                    ckpt.dir.display(), policy.min_key, value
                );
                kept = false;
            } else {
                fs::remove_dir_all(&ckpt.dir)
                    .with_context(|| format!("Cannot delete '{}'", ckpt.dir.display()))?;
                tracing::debug!(
                    "Deleted checkpoint '{}' ({}={})",
                    ckpt.dir.display(), policy.min_key, value
                );
            }
        }

        // a kept newest checkpoint is its own resume point
        if kept {
            remove_if_present(&resume)?;
        }
        Ok(kept)
    }

    // ─── Config persistence ───────────────────────────────────────────────────

    /// Save the effective training configuration as JSON.
    pub fn save_config<C: Serialize>(&self, cfg: &C) -> Result<()> {
        let path = self.dir.join("train_config.json");
        fs::write(&path, serde_json::to_string_pretty(cfg)?)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    /// Load the configuration saved by `save_config`.
    pub fn load_config<C: DeserializeOwned>(&self) -> Result<C> {
        let path = self.dir.join("train_config.json");
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' before 'evaluate'.",
                path.display()
            )
        })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed config '{}'", path.display()))
    }
}

fn read_meta(path: &Path) -> Result<CheckpointMeta> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("Malformed '{}'", path.display()))
}

fn remove_if_present(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Cannot delete '{}'", dir.display()))?;
    }
    Ok(())
}
