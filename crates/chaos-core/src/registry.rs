//! Run-wide target status registry
//!
//! Single source of truth for which targets are injected, which have an
//! injection in flight, and whether the abort latch is set. The scheduler
//! and the abort watcher share one registry per run.

use crate::error::ChaosError;
use crate::types::{Target, TargetId, TargetStatus};
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct RegistryState {
    targets: Vec<Target>,
    in_flight: BTreeSet<TargetId>,
    aborting: bool,
}

impl RegistryState {
    fn entry(&mut self, id: &TargetId) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| &t.id == id)
    }

    fn pending(&self) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| t.status == TargetStatus::Injected || self.in_flight.contains(&t.id))
            .cloned()
            .collect()
    }
}

/// Target status registry
#[derive(Debug, Default)]
pub struct TargetRegistry {
    inner: Mutex<RegistryState>,
}

impl TargetRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add targets not seen before; known targets keep their status
    pub fn register(&self, targets: &[Target]) {
        let mut state = self.inner.lock();
        for target in targets {
            if state.entry(&target.id).is_none() {
                state.targets.push(target.clone());
            }
        }
    }

    /// Upsert a target, overwriting the status of a known one
    pub fn upsert(&self, target: &Target) {
        let mut state = self.inner.lock();
        match state.entry(&target.id) {
            Some(existing) => *existing = target.clone(),
            None => state.targets.push(target.clone()),
        }
    }

    /// Record that an injection is about to be issued against `id`
    ///
    /// # Errors
    /// Returns `ChaosError::Aborted` once the abort latch is set; nothing new
    /// may be injected after that point.
    pub fn begin_inject(&self, id: &TargetId) -> Result<(), ChaosError> {
        let mut state = self.inner.lock();
        if state.aborting {
            return Err(ChaosError::Aborted);
        }
        state.in_flight.insert(id.clone());
        Ok(())
    }

    /// Injection confirmed
    pub fn mark_injected(&self, id: &TargetId) {
        self.set_status(id, TargetStatus::Injected);
    }

    /// Revert confirmed
    ///
    /// Targets that were never confirmed injected stay `NotInjected`.
    /// Returns `true` if the target moved to `Reverted`.
    pub fn mark_reverted(&self, id: &TargetId) -> bool {
        let mut state = self.inner.lock();
        state.in_flight.remove(id);
        match state.entry(id) {
            Some(target) if target.status == TargetStatus::Injected => {
                target.status = TargetStatus::Reverted;
                true
            }
            _ => false,
        }
    }

    /// Mark `id` in flight again, even after the abort latch was set
    ///
    /// Used for injections that returned after the abort snapshot; the
    /// target's status is left as is.
    pub fn requeue_revert(&self, id: &TargetId) {
        self.inner.lock().in_flight.insert(id.clone());
    }

    /// Drop the in-flight marker without a status change
    pub fn clear_in_flight(&self, id: &TargetId) {
        self.inner.lock().in_flight.remove(id);
    }

    /// Set the abort latch and return every target that may carry a fault
    ///
    /// Returns `None` when the latch was already set.
    pub fn begin_abort(&self) -> Option<Vec<Target>> {
        let mut state = self.inner.lock();
        if state.aborting {
            return None;
        }
        state.aborting = true;
        Some(state.pending())
    }

    /// Targets injected or with an injection in flight
    #[must_use]
    pub fn pending_revert(&self) -> Vec<Target> {
        self.inner.lock().pending()
    }

    /// Whether the abort latch is set
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.inner.lock().aborting
    }

    /// Status of `id`, if registered
    #[must_use]
    pub fn status(&self, id: &TargetId) -> Option<TargetStatus> {
        self.inner
            .lock()
            .targets
            .iter()
            .find(|t| &t.id == id)
            .map(|t| t.status)
    }

    /// All registered targets in registration order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Target> {
        self.inner.lock().targets.clone()
    }

    fn set_status(&self, id: &TargetId, status: TargetStatus) {
        let mut state = self.inner.lock();
        state.in_flight.remove(id);
        match state.entry(id) {
            Some(target) => target.status = status,
            None => {
                tracing::warn!(target_id = %id, %status, "[Warning]: Status update for unregistered target");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetKind;

    fn registry_with(ids: &[&str]) -> TargetRegistry {
        let registry = TargetRegistry::new();
        let targets: Vec<_> = ids
            .iter()
            .map(|id| Target::new(*id, TargetKind::Instance))
            .collect();
        registry.register(&targets);
        registry
    }

    #[test]
    fn status_lifecycle() {
        let registry = registry_with(&["i-1"]);
        let id = TargetId::from("i-1");

        registry.begin_inject(&id).unwrap();
        assert_eq!(registry.pending_revert().len(), 1);
        registry.mark_injected(&id);
        assert_eq!(registry.status(&id), Some(TargetStatus::Injected));
        assert!(registry.mark_reverted(&id));
        assert!(!registry.mark_reverted(&id));
        assert_eq!(registry.status(&id), Some(TargetStatus::Reverted));
        assert!(registry.pending_revert().is_empty());
    }

    #[test]
    fn abort_snapshot_includes_in_flight() {
        let registry = registry_with(&["i-1", "i-2", "i-3"]);
        registry.begin_inject(&"i-1".into()).unwrap();
        registry.mark_injected(&"i-1".into());
        registry.begin_inject(&"i-2".into()).unwrap();

        let pending = registry.begin_abort().unwrap();
        let ids: Vec<_> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);

        assert!(registry.begin_abort().is_none());
        assert!(matches!(
            registry.begin_inject(&"i-3".into()),
            Err(ChaosError::Aborted)
        ));
    }

    #[test]
    fn requeue_bypasses_the_abort_latch() {
        let registry = registry_with(&["i-1"]);
        let id = TargetId::from("i-1");
        registry.begin_inject(&id).unwrap();
        registry.begin_abort().unwrap();
        registry.clear_in_flight(&id);
        assert!(registry.pending_revert().is_empty());

        registry.requeue_revert(&id);
        assert_eq!(registry.pending_revert().len(), 1);
        assert_eq!(registry.status(&id), Some(TargetStatus::NotInjected));
    }

    #[test]
    fn never_injected_stays_not_injected() {
        let registry = registry_with(&["i-1"]);
        let id = TargetId::from("i-1");
        registry.begin_inject(&id).unwrap();
        assert!(!registry.mark_reverted(&id));
        assert_eq!(registry.status(&id), Some(TargetStatus::NotInjected));
    }

    #[test]
    fn register_keeps_status_upsert_overwrites() {
        let registry = registry_with(&["i-1"]);
        registry.mark_injected(&"i-1".into());
        registry.register(&[Target::new("i-1", TargetKind::Instance)]);
        assert_eq!(registry.status(&"i-1".into()), Some(TargetStatus::Injected));

        registry.upsert(&Target::new("i-1", TargetKind::Instance));
        assert_eq!(registry.status(&"i-1".into()), Some(TargetStatus::NotInjected));
        assert_eq!(registry.snapshot().len(), 1);
    }
}
