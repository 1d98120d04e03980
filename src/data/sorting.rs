// ============================================================
// Layer 4 — Sorting Strategy
// ============================================================
// Decides the order in which training utterances are batched:
//
//   ascending   → shortest first, fixed order every epoch
//   descending  → longest first, fixed order every epoch
//   random      → order left to the data loader, which
//                 reshuffles it every epoch from a seed
//
// Validation and test splits are always sorted ascending:
// similar lengths in a batch mean less padding.
//
// Any other value is a configuration error, raised when the
// configuration is parsed and never at batch time.
//
// Reference: Rust Book §8 (Vectors), std slice::sort_by

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::utterance::Utterance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortingStrategy {
    #[default]
    Ascending,
    Descending,
    Random,
}

impl SortingStrategy {
    /// Reorder `utterances` in place by duration.
    /// `Random` leaves the manifest order untouched.
    pub fn arrange(self, utterances: &mut [Utterance]) {
        match self {
            Self::Ascending  => utterances.sort_by(|a, b| a.length.total_cmp(&b.length)),
            Self::Descending => utterances.sort_by(|a, b| b.length.total_cmp(&a.length)),
            Self::Random     => {}
        }
    }

    /// Whether the data loader should reshuffle every epoch
    pub fn shuffles(self) -> bool {
        matches!(self, Self::Random)
    }
}

impl fmt::Display for SortingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ascending  => "ascending",
            Self::Descending => "descending",
            Self::Random     => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for SortingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascending"  => Ok(Self::Ascending),
            "descending" => Ok(Self::Descending),
            "random"     => Ok(Self::Random),
            other => Err(format!(
                "sorting must be random, ascending or descending, got '{other}'"
            )),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn utts() -> Vec<Utterance> {
        vec![
            Utterance::new("b", "b.wav", "b", 2.0),
            Utterance::new("a", "a.wav", "a", 1.0),
            Utterance::new("c", "c.wav", "c", 3.0),
        ]
    }

    fn ids(u: &[Utterance]) -> Vec<&str> {
        u.iter().map(|u| u.id.as_str()).collect()
    }

    #[test]
    fn test_ascending() {
        let mut u = utts();
        SortingStrategy::Ascending.arrange(&mut u);
        assert_eq!(ids(&u), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_descending() {
        let mut u = utts();
        SortingStrategy::Descending.arrange(&mut u);
        assert_eq!(ids(&u), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_random_keeps_order_and_shuffles() {
        let mut u = utts();
        SortingStrategy::Random.arrange(&mut u);
        assert_eq!(ids(&u), vec!["b", "a", "c"]);
        assert!(SortingStrategy::Random.shuffles());
        assert!(!SortingStrategy::Ascending.shuffles());
    }

    #[test]
    fn test_parse() {
        assert_eq!("random".parse::<SortingStrategy>(), Ok(SortingStrategy::Random));
        assert!("shortest".parse::<SortingStrategy>().is_err());
    }

    #[test]
    fn test_serde_rejects_unknown() {
        let ok: SortingStrategy = serde_json::from_str("\"descending\"").unwrap();
        assert_eq!(ok, SortingStrategy::Descending);
        assert!(serde_json::from_str::<SortingStrategy>("\"sideways\"").is_err());
    }
}
