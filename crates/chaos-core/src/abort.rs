//! Abort signalling and revert-on-abort
//!
//! An [`AbortSignal`] is a one-shot, run-wide latch. The [`AbortWatcher`]
//! waits on it concurrently with the scheduler; when it fires, the watcher
//! locks the scheduler phase, sets the registry abort latch, reverts every
//! injected or in-flight target exactly once and releases workers.

use crate::error::ChaosError;
use crate::registry::TargetRegistry;
use crate::scheduler::FaultStrategy;
use crate::state_machine::PhaseTracker;
use crate::types::{Target, TargetId};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Run-wide abort latch
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    /// Untriggered signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; later calls are no-ops
    ///
    /// Returns `true` for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        let first = !self.tx.send_replace(true);
        if first {
            tracing::warn!("[Abort]: Abort signal received");
        }
        first
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// New listener
    #[must_use]
    pub fn listener(&self) -> AbortListener {
        AbortListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`AbortSignal`]
#[derive(Debug, Clone)]
pub struct AbortListener {
    rx: watch::Receiver<bool>,
}

impl AbortListener {
    /// Whether the signal has fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires
    ///
    /// Never resolves if every [`AbortSignal`] handle is dropped untriggered.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A target whose revert failed during abort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRevert {
    /// Target left in an unknown state
    pub target: TargetId,
    /// Why the revert failed
    pub reason: String,
}

/// Outcome of abort handling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    /// Targets confirmed reverted
    pub reverted: Vec<TargetId>,
    /// Targets whose revert failed
    pub failed: Vec<FailedRevert>,
    /// Worker/strategy cleanup failure, if any
    pub cleanup_error: Option<String>,
}

impl AbortReport {
    /// Every revert and the cleanup succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cleanup_error.is_none()
    }

    /// Fold a later report into this one
    pub fn merge(&mut self, other: AbortReport) {
        self.reverted.extend(other.reverted);
        self.failed.extend(other.failed);
        if self.cleanup_error.is_none() {
            self.cleanup_error = other.cleanup_error;
        }
    }
}

/// Concurrent abort handler for one run
pub struct AbortWatcher {
    registry: Arc<TargetRegistry>,
    strategy: Arc<dyn FaultStrategy>,
    phase: Arc<PhaseTracker>,
    /// Targets already handled, with whether the revert succeeded
    handled: Mutex<HashMap<TargetId, bool>>,
}

impl std::fmt::Debug for AbortWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortWatcher")
            .field("strategy", &self.strategy.name())
            .field("handled", &self.handled.lock().len())
            .finish_non_exhaustive()
    }
}

impl AbortWatcher {
    /// Create watcher over the run's shared state
    #[must_use]
    pub fn new(
        registry: Arc<TargetRegistry>,
        strategy: Arc<dyn FaultStrategy>,
        phase: Arc<PhaseTracker>,
    ) -> Self {
        Self {
            registry,
            strategy,
            phase,
            handled: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the watcher on the runtime
    pub fn spawn(self: &Arc<Self>, listener: AbortListener) -> JoinHandle<AbortReport> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.watch(listener).await })
    }

    /// Wait for the signal, then revert
    pub async fn watch(&self, mut listener: AbortListener) -> AbortReport {
        listener.wait().await;
        self.handle_abort().await
    }

    /// Lock the scheduler out and revert everything that may carry a fault
    ///
    /// Only the first call does any work.
    pub async fn handle_abort(&self) -> AbortReport {
        self.phase.enter_aborting();
        let Some(targets) = self.registry.begin_abort() else {
            tracing::debug!("[Abort]: Abort already handled");
            return AbortReport::default();
        };

        tracing::warn!(pending = targets.len(), "[Abort]: Chaos Revert Started");
        let mut report = self.revert_all(targets).await;

        if let Err(e) = self.strategy.cleanup().await {
            tracing::error!(error = %e, "[Abort]: Cleanup after abort failed");
            report.cleanup_error = Some(e.to_string());
        }

        tracing::warn!(
            reverted = report.reverted.len(),
            failed = report.failed.len(),
            "[Abort]: Chaos Revert Completed"
        );
        report
    }

    /// Revert targets that became injected while the abort was in progress
    ///
    /// Called once the scheduler has been stopped. Targets whose abort revert
    /// failed are not retried.
    pub async fn sweep(&self) -> AbortReport {
        let leftovers: Vec<Target> = {
            let handled = self.handled.lock();
            self.registry
                .pending_revert()
                .into_iter()
                .filter(|t| handled.get(&t.id).copied() != Some(false))
                .collect()
        };
        if leftovers.is_empty() {
            return AbortReport::default();
        }

        tracing::warn!(count = leftovers.len(), "[Abort]: Reverting targets injected during abort");
        self.revert_all(leftovers).await
    }

    async fn revert_all(&self, targets: Vec<Target>) -> AbortReport {
        let outcomes = join_all(targets.iter().map(|t| self.revert_one(t))).await;

        let mut report = AbortReport::default();
        for (target, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.reverted.push(target.id),
                Err(e) => report.failed.push(FailedRevert {
                    target: target.id,
                    reason: e.to_string(),
                }),
            }
        }
        report
    }

    async fn revert_one(&self, target: &Target) -> Result<(), ChaosError> {
        if self.handled.lock().insert(target.id.clone(), true).is_some() {
            tracing::warn!(target_id = %target.id, "[Abort]: Target handed back during abort, reverting again");
        }

        match self.strategy.emergency_revert(slice::from_ref(target)).await {
            Ok(()) => {
                if !self.registry.mark_reverted(&target.id) {
                    self.registry.clear_in_flight(&target.id);
                }
                tracing::info!(target_id = %target.id, "[Abort]: Target reverted");
                Ok(())
            }
            Err(e) => {
                self.handled.lock().insert(target.id.clone(), false);
                tracing::error!(target_id = %target.id, error = %e, "[Abort]: Failed to revert target");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_is_one_shot() {
        let signal = AbortSignal::new();
        let listener = signal.listener();
        assert!(!listener.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(listener.is_triggered());
        assert!(signal.clone().is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn listener_wakes_on_trigger() {
        let signal = AbortSignal::new();
        let mut listener = signal.listener();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        });
        listener.wait().await;
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_is_pending_until_triggered() {
        let signal = AbortSignal::new();
        let mut listener = signal.listener();
        let mut wait = tokio_test::task::spawn(listener.wait());
        tokio_test::assert_pending!(wait.poll());

        signal.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn listener_never_wakes_when_signal_dropped() {
        let signal = AbortSignal::new();
        let mut listener = signal.listener();
        drop(signal);
        let waited = tokio::time::timeout(Duration::from_secs(60), listener.wait()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn report_merge() {
        let mut report = AbortReport {
            reverted: vec!["a".into()],
            ..AbortReport::default()
        };
        report.merge(AbortReport {
            reverted: vec!["b".into()],
            failed: vec![FailedRevert {
                target: "c".into(),
                reason: "boom".into(),
            }],
            cleanup_error: Some("leak".into()),
        });
        assert_eq!(report.reverted.len(), 2);
        assert!(!report.is_clean());
        assert_eq!(report.cleanup_error.as_deref(), Some("leak"));
    }
}
