// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Handles the cross-cutting concerns that don't belong in any
// specific business layer:
//
//   checkpoint.rs    — Checkpoint snapshots on disk
//                      Writes model, optimizer and scheduler
//                      state atomically, keeps only the best
//                      checkpoints by a monitored metric and
//                      saves/loads TrainConfig as JSON.
//
//   label_encoder.rs — Character label encoder persistence
//                      Builds the encoder from the training
//                      transcripts on the first run and reloads
//                      it afterwards, so label ids never change
//                      between training and evaluation.
//
//   metrics.rs       — Training log
//                      One CSV row per validation pass and per
//                      test pass, mirrored as tracing events.
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Checkpoint saving, pruning and loading
pub mod checkpoint;

/// Label encoder building, saving and loading
pub mod label_encoder;

/// Training log CSV writer
pub mod metrics;
