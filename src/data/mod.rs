// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from a JSON manifest all the
// way to padded tensor batches.
//
// The pipeline flows in this order:
//
//   train.json / valid.json / test.json
//       │
//       ▼
//   JsonManifest      → reads entries, resolves {data_root}
//       │
//       ▼
//   SortingStrategy   → orders utterances by duration
//       │
//       ▼
//   LabelEncoder      → transcript characters to label ids
//       │
//       ▼
//   UtteranceDataset  → implements Burn's Dataset trait
//       │                 (or BucketedDataset with dynamic batching)
//       ▼
//   AsrBatcher        → reads WAVs, pads audio and tokens
//       │
//       ▼
//   DataLoader        → feeds batches to the supervisor
//
// Reference: Burn Book §4 (Datasets and Dataloaders)
//            Rust Book §13 (Iterators and Closures)

/// Loads a JSON dataset manifest
pub mod loader;

/// Reads WAV files into mono samples with hound
pub mod audio;

/// Ascending / descending / random ordering of utterances
pub mod sorting;

/// Implements Burn's Dataset trait for encoded utterances
pub mod dataset;

/// Implements Burn's Batcher trait to create padded batches
pub mod batcher;

/// Duration buckets for batches sized by audio length
pub mod bucketing;
