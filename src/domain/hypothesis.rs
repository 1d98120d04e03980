// ============================================================
// Layer 3 — Hypothesis Domain Type
// ============================================================
// The output of one search (greedy or beam) for one utterance.
// Token ids exclude the BOS prefix and the EOS terminator.
// Hypotheses feed the metric accumulator and are never stored
// in a checkpoint.

/// A decoded token sequence and its accumulated log score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Predicted label ids, without BOS/EOS
    pub tokens: Vec<usize>,

    /// Sum of per-step log-probabilities (beam search may
    /// length-normalise this)
    pub score: f32,
}

impl Hypothesis {
    pub fn new(tokens: Vec<usize>, score: f32) -> Self {
        Self { tokens, score }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
