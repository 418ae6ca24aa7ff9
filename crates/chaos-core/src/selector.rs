//! Target selection
//!
//! Derives the subset of candidates to inject from an affected percentage.
//! The subset is a contiguous, wrap-around window over the de-duplicated
//! candidate list. The window start comes from the selector's seed, so
//! repeated calls within one run return the same targets.

use crate::error::ChaosError;
use crate::types::Target;
use std::collections::HashSet;

/// Number of targets for `candidates` at `percent`
///
/// `percent` is clamped to `[0, 100]`; zero means exactly one target.
#[must_use]
pub fn selection_count(candidates: usize, percent: i32) -> usize {
    if candidates == 0 {
        return 0;
    }
    let percent = usize::try_from(percent.clamp(0, 100)).unwrap_or(0);
    (candidates * percent).div_ceil(100).clamp(1, candidates)
}

/// Deterministic, seeded target selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSelector {
    seed: u64,
}

impl TargetSelector {
    /// Selector with a fixed seed
    #[inline]
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Selector with a random seed, fixed for the lifetime of one run
    #[must_use]
    pub fn for_run() -> Self {
        Self::new(rand::random())
    }

    /// Seed in use
    #[inline]
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Select the targets to inject
    ///
    /// # Errors
    /// Returns `ChaosError::TargetSelection` when there are no candidates
    pub fn select(&self, candidates: &[Target], percent: i32) -> Result<Vec<Target>, ChaosError> {
        let mut seen = HashSet::with_capacity(candidates.len());
        let unique: Vec<&Target> = candidates
            .iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect();

        if unique.is_empty() {
            return Err(ChaosError::selection("no eligible targets found"));
        }

        let count = selection_count(unique.len(), percent);
        if count == 0 {
            return Err(ChaosError::selection(format!(
                "affected percentage {percent} selects no targets out of {}",
                unique.len()
            )));
        }

        let len = unique.len() as u64;
        let start = usize::try_from(self.seed % len).unwrap_or(0);
        let selected = (0..count)
            .map(|i| unique[(start + i) % unique.len()].clone())
            .collect();

        tracing::debug!(
            candidates = unique.len(),
            percent,
            selected = count,
            "[Info]: Target selection complete"
        );
        Ok(selected)
    }
}

impl Default for TargetSelector {
    fn default() -> Self {
        Self::for_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetKind;

    fn pods(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::new(format!("pod-{i}"), TargetKind::Pod))
            .collect()
    }

    #[test]
    fn zero_percent_selects_exactly_one() {
        let selected = TargetSelector::new(3).select(&pods(10), 0).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn counts_round_up() {
        assert_eq!(selection_count(10, 33), 4);
        assert_eq!(selection_count(3, 50), 2);
        assert_eq!(selection_count(4, 100), 4);
        assert_eq!(selection_count(4, 250), 4);
        assert_eq!(selection_count(4, -20), 1);
        assert_eq!(selection_count(0, 50), 0);
    }

    #[test]
    fn empty_candidates_fail() {
        let err = TargetSelector::new(0).select(&[], 50).unwrap_err();
        assert!(matches!(err, ChaosError::TargetSelection { .. }));
    }

    #[test]
    fn window_wraps_around() {
        let selected = TargetSelector::new(4).select(&pods(5), 60).unwrap();
        let ids: Vec<_> = selected.iter().map(|t| t.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["pod-4", "pod-0", "pod-1"]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut candidates = pods(2);
        candidates.push(Target::new("pod-0", TargetKind::Pod));
        let selected = TargetSelector::new(0).select(&candidates, 100).unwrap();
        assert_eq!(selected.len(), 2);
    }
}
