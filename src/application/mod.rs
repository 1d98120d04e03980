// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// a specific goal (training, or re-running the test pass).
//
// Rules for this layer:
//   - No loss or decoding math here
//   - No printing here (that's Layer 1)
//   - Only workflow coordination: build the parts, hand them
//     to the supervisor, return what it reports
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The training workflow, and TrainConfig
pub mod train_use_case;

// The stand-alone test workflow
pub mod evaluate_use_case;
