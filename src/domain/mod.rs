// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust structs, enums and traits describing a training
// run: stages, the epoch counter, the CTC curriculum,
// utterances, hypotheses and error-rate scoring.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O (report writers take any io::Write)
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §6 (Enums), §10 (Traits)

// Train / Valid / Test and the completed-epoch counter
pub mod stage;

// CTC weight and cutoff epoch, validated once
pub mod curriculum;

// A manifest entry: audio path + reference words
pub mod utterance;

// A decoded token sequence with its score
pub mod hypothesis;

// Edit distance, WER/CER accumulation and report writing
pub mod error_rate;

// Core abstractions (traits) that other layers implement
pub mod traits;
