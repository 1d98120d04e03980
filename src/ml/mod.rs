// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// This layer contains ALL tensor code. The domain layer stays
// free of Burn, so alignment, curricula and epoch counting are
// testable without a backend.
//
// What's in this layer:
//
//   model.rs      — Feature extractor + seq2seq head with a CTC
//                   projection and an attentional GRU decoder
//
//   loss.rs       — CTC and label-smoothed NLL losses, and the
//                   LossComposer that blends them per curriculum
//
//   lm.rs         — Optional external RNN language model used
//                   for shallow fusion during beam search
//
//   decoder.rs    — DecoderSelector: greedy on VALID, beam
//                   search (+ LM) on TEST
//
//   optim.rs      — OptimizerPair: one Adam per parameter group,
//                   NewBob annealing, gradient validity guard
//
//   evaluator.rs  — One VALID or TEST pass: loss, decoding,
//                   WER/CER accumulation, wer.txt report
//
//   supervisor.rs — The training loop with recovery, per-epoch
//                   validation, annealing and checkpointing
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Graves et al. (2006) Connectionist Temporal Classification
//            Kim et al. (2017) Joint CTC-Attention based End-to-End Speech Recognition

/// Acoustic model architecture
pub mod model;

/// CTC / sequence losses and the curriculum-aware loss composer
pub mod loss;

/// External language model for shallow fusion
pub mod lm;

/// Greedy and beam search decoding
pub mod decoder;

/// Two-group optimizer with NewBob schedulers
pub mod optim;

/// Validation and test passes
pub mod evaluator;

/// Training loop, recovery and testing
pub mod supervisor;

#[cfg(test)]
pub mod test_utils;
