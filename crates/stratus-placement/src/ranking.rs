//! Ranked-candidate ordering.
//!
//! The external ranker returns a flat list of candidates with a numeric
//! rank and an eligibility flag. `ProviderRanking` turns that into the
//! ordered sequence the selector consumes: ineligible candidates are
//! dropped, the rest sort ascending by rank (lower = preferred) with
//! ties keeping their input order.

use serde::{Deserialize, Serialize};

/// One candidate provider as scored by the external ranker. Transient —
/// consumed once per deployment attempt sequence, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub provider: String,
    /// Preference rank; lower is better.
    pub rank: u32,
    /// Candidates the ranker could not score are marked ineligible.
    pub eligible: bool,
    /// Ranker-side error message, when one was reported.
    pub error: Option<String>,
}

impl RankedCandidate {
    pub fn new(provider: impl Into<String>, rank: u32, eligible: bool) -> Self {
        Self {
            provider: provider.into(),
            rank,
            eligible,
            error: None,
        }
    }
}

/// The full ranker result for one deployment attempt sequence.
#[derive(Debug, Clone, Default)]
pub struct ProviderRanking {
    candidates: Vec<RankedCandidate>,
}

impl ProviderRanking {
    pub fn new(candidates: Vec<RankedCandidate>) -> Self {
        Self { candidates }
    }

    /// Eligible candidates in non-decreasing rank order, optionally
    /// truncated to the first `cap` entries.
    ///
    /// Each call returns a fresh sequence, so a full pass can be
    /// re-iterated. Empty input or all-ineligible input yields an empty
    /// sequence; whether that is fatal is the caller's call.
    pub fn ordered_eligible(&self, cap: Option<usize>) -> Vec<&RankedCandidate> {
        let mut eligible: Vec<&RankedCandidate> =
            self.candidates.iter().filter(|c| c.eligible).collect();
        // Stable sort: ties keep input order.
        eligible.sort_by_key(|c| c.rank);
        if let Some(cap) = cap {
            eligible.truncate(cap);
        }
        eligible
    }
}
