//! Ephemeral worker manager
//!
//! Creates workers, waits for them to become ready and to finish, and
//! releases them. Whatever `create` allocates, exactly one `cleanup`
//! releases; a second `cleanup` of the same handle is a no-op.

use super::backend::{WorkerBackend, WorkerPhase, WorkerSpec};
use crate::abort::AbortListener;
use crate::config::{CleanupPolicy, RetryPolicy};
use crate::error::{ChaosError, HelperFailure, PollError};
use crate::retry::Poll;
use crate::types::WorkerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of a managed worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Creating,
    Ready,
    Running,
    Completed,
    Failed,
}

impl WorkerState {
    /// States reachable from `self`
    #[must_use]
    pub fn next_states(self) -> &'static [WorkerState] {
        use WorkerState::{Completed, Creating, Failed, Ready, Running};
        match self {
            Creating => &[Ready, Failed],
            Ready => &[Running, Completed, Failed],
            Running => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    /// Whether `self -> to` is a legal move
    #[inline]
    #[must_use]
    pub fn can_transition(self, to: WorkerState) -> bool {
        self.next_states().contains(&to)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A worker that ran to `Succeeded`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Platform name
    pub worker: String,
    /// Time from the start of the wait to the terminal phase
    pub elapsed: Duration,
    /// Status checks it took
    pub polls: u32,
}

/// Handle to a created worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Local identifier
    pub id: WorkerId,
    /// Platform name
    pub name: String,
    /// Spec it was created from
    pub spec: Arc<WorkerSpec>,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerHandle {
    fn new(spec: WorkerSpec) -> Self {
        Self {
            id: WorkerId::new(),
            name: spec.name(),
            spec: Arc::new(spec),
            state: Arc::new(Mutex::new(WorkerState::Creating)),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn advance(&self, to: WorkerState) {
        let mut state = self.state.lock();
        if *state == to {
            return;
        }
        if state.can_transition(to) {
            *state = to;
        } else {
            tracing::debug!(worker = %self.name, from = %*state, %to, "[Info]: Ignoring worker state regression");
        }
    }
}

/// Manager statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Workers created
    pub created: usize,
    /// Workers released
    pub cleaned: usize,
    /// Workers currently tracked
    pub active: usize,
}

/// Ephemeral worker manager
pub struct WorkerManager {
    backend: Arc<dyn WorkerBackend>,
    policy: CleanupPolicy,
    active: DashMap<WorkerId, WorkerHandle>,
    stats: Mutex<WorkerStats>,
    cancel: Option<AbortListener>,
}

impl fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerManager")
            .field("policy", &self.policy)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl WorkerManager {
    /// Create manager over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn WorkerBackend>, policy: CleanupPolicy) -> Self {
        Self {
            backend,
            policy,
            active: DashMap::new(),
            stats: Mutex::new(WorkerStats::default()),
            cancel: None,
        }
    }

    /// Stop waiting for workers once the abort signal fires
    ///
    /// Waits then fail with `ChaosError::Aborted`; nothing is cleaned up on
    /// their behalf.
    #[must_use]
    pub fn cancel_on(mut self, listener: AbortListener) -> Self {
        self.cancel = Some(listener);
        self
    }

    /// Create a worker; returns once the platform accepted it
    ///
    /// The handle is tracked before the platform call is issued, so a
    /// [`cleanup_all`](Self::cleanup_all) racing the creation still releases
    /// it. A worker released while its create call was in flight is deleted
    /// again once the call returns.
    ///
    /// # Errors
    /// - `ChaosError::Capability` if the platform rejected the create call
    /// - `ChaosError::HelperUnavailable` if the worker was released mid-create
    pub async fn create(&self, spec: WorkerSpec) -> Result<WorkerHandle, ChaosError> {
        let handle = WorkerHandle::new(spec);
        tracing::info!(worker = %handle.name, targets = handle.spec.targets.len(), "[Info]: Creating helper");

        self.active.insert(handle.id, handle.clone());
        if let Err(e) = self.backend.create_worker(&handle.spec).await {
            self.active.remove(&handle.id);
            return Err(e.into());
        }
        self.stats.lock().created += 1;

        if !self.active.contains_key(&handle.id) {
            tracing::warn!(worker = %handle.name, "[Cleanup]: Helper released while being created, deleting it");
            handle.advance(WorkerState::Failed);
            if self.policy == CleanupPolicy::Delete {
                match self.backend.delete_worker(&handle.name).await {
                    Err(e) if !e.is_not_found() => {
                        tracing::error!(worker = %handle.name, error = %e, "[Cleanup]: Failed to delete released helper");
                    }
                    _ => {}
                }
            }
            return Err(ChaosError::HelperUnavailable {
                worker: handle.name.clone(),
                reason: "released while being created".to_string(),
            });
        }
        Ok(handle)
    }

    /// Wait until the worker has left `Pending`
    ///
    /// A worker that never becomes ready is cleaned up before the error is
    /// returned.
    ///
    /// # Errors
    /// `ChaosError::HelperUnavailable` once `policy` is exhausted
    pub async fn await_ready(&self, handle: &WorkerHandle, policy: RetryPolicy) -> Result<(), ChaosError> {
        tracing::info!(worker = %handle.name, "[Status]: Checking the status of the helper");

        let backend = &self.backend;
        let name = handle.name.as_str();
        let polled = self
            .poll(Poll::from_policy(policy))
            .until(|_| async move {
                match backend.worker_phase(name).await {
                    Ok(phase) if phase.is_started() => Ok(()),
                    Ok(phase) => Err(format!("helper is in {phase} state")),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match polled {
            Ok(()) => {
                handle.advance(WorkerState::Ready);
                Ok(())
            }
            Err(PollError::Cancelled) => Err(ChaosError::Aborted),
            Err(e) => {
                handle.advance(WorkerState::Failed);
                if let Err(cleanup) = self.cleanup(handle).await {
                    tracing::error!(worker = %handle.name, error = %cleanup, "[Cleanup]: Failed to remove unready helper");
                }
                Err(ChaosError::HelperUnavailable {
                    worker: handle.name.clone(),
                    reason: e.into_state_check("helper ready").to_string(),
                })
            }
        }
    }

    /// Wait until the worker reaches a terminal phase
    ///
    /// Polls every `delay` and gives up once `deadline` has passed, however
    /// long individual status calls take. Does not clean up.
    ///
    /// # Errors
    /// - `ChaosError::HelperFailed` when the worker fails or overruns `deadline`
    /// - `ChaosError::Aborted` when the wait was cancelled
    pub async fn await_completion(
        &self,
        handle: &WorkerHandle,
        deadline: Duration,
        delay: Duration,
    ) -> Result<WorkerOutcome, ChaosError> {
        tracing::info!(worker = %handle.name, deadline_secs = deadline.as_secs(), "[Wait]: Waiting till the completion of the helper");

        let started = Instant::now();
        let finished: Mutex<Option<(WorkerPhase, u32)>> = Mutex::new(None);
        let attempts = match u32::try_from(deadline.as_millis() / delay.as_millis().max(1)) {
            Ok(n) => n.saturating_add(1),
            Err(_) => u32::MAX,
        };

        let backend = &self.backend;
        let terminal = &finished;
        let polled = self
            .poll(Poll::times(attempts).wait(delay).deadline(started + deadline))
            .until(|attempt| async move {
                match backend.worker_phase(&handle.name).await {
                    Ok(phase) if phase.is_terminal() => {
                        *terminal.lock() = Some((phase, attempt + 1));
                        Ok(())
                    }
                    Ok(phase) => {
                        if phase == WorkerPhase::Running {
                            handle.advance(WorkerState::Running);
                        }
                        Err(format!("helper is in {phase} state"))
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match (polled, finished.into_inner()) {
            (Ok(()), Some((WorkerPhase::Succeeded, polls))) => {
                handle.advance(WorkerState::Completed);
                Ok(WorkerOutcome {
                    worker: handle.name.clone(),
                    elapsed: started.elapsed(),
                    polls,
                })
            }
            (Ok(()), Some((WorkerPhase::Failed { reason }, _))) => {
                handle.advance(WorkerState::Failed);
                Err(ChaosError::HelperFailed {
                    worker: handle.name.clone(),
                    cause: HelperFailure::Terminated { reason },
                })
            }
            (Err(PollError::Cancelled), _) => Err(ChaosError::Aborted),
            (result, _) => {
                if let Err(e) = result {
                    tracing::warn!(worker = %handle.name, error = %e, "[Wait]: Helper did not finish");
                }
                handle.advance(WorkerState::Failed);
                Err(ChaosError::HelperFailed {
                    worker: handle.name.clone(),
                    cause: HelperFailure::DeadlineExceeded { after: deadline },
                })
            }
        }
    }

    /// Release a worker according to the cleanup policy
    ///
    /// Idempotent: a handle already released is ignored.
    ///
    /// # Errors
    /// `ChaosError::Capability` if deletion failed for any reason other than
    /// the worker already being gone; the worker stays tracked.
    pub async fn cleanup(&self, handle: &WorkerHandle) -> Result<(), ChaosError> {
        // untrack first so an in-flight create can see the release
        let Some((id, tracked)) = self.active.remove(&handle.id) else {
            return Ok(());
        };

        if self.policy == CleanupPolicy::Delete {
            tracing::info!(worker = %handle.name, "[Cleanup]: Deleting the helper");
            match self.backend.delete_worker(&handle.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(worker = %handle.name, "[Cleanup]: Helper already gone");
                }
                Err(e) => {
                    self.active.insert(id, tracked);
                    return Err(e.into());
                }
            }
        } else {
            tracing::info!(worker = %handle.name, "[Cleanup]: Retaining the helper per cleanup policy");
        }

        self.stats.lock().cleaned += 1;
        Ok(())
    }

    /// Release every tracked worker
    ///
    /// # Errors
    /// The first cleanup failure, after every worker was attempted
    pub async fn cleanup_all(&self) -> Result<(), ChaosError> {
        let handles: Vec<WorkerHandle> = self.active.iter().map(|e| e.value().clone()).collect();
        let mut first = None;
        for handle in &handles {
            if let Err(e) = self.cleanup(handle).await {
                tracing::error!(worker = %handle.name, error = %e, "[Cleanup]: Failed to clean up helper");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Create, wait ready, wait completion, and always clean up
    ///
    /// # Errors
    /// The first failure of any step, or the cleanup failure if every step
    /// succeeded
    pub async fn run_to_completion(
        &self,
        spec: WorkerSpec,
        ready: RetryPolicy,
        deadline: Duration,
    ) -> Result<WorkerOutcome, ChaosError> {
        let handle = self.create(spec).await?;

        let result = async {
            self.await_ready(&handle, ready).await?;
            self.await_completion(&handle, deadline, ready.delay).await
        }
        .await;

        let released = self.cleanup(&handle).await;
        match (result, released) {
            (Err(e), Err(cleanup)) => {
                tracing::error!(worker = %handle.name, error = %cleanup, "[Cleanup]: Failed to clean up helper");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Ok(outcome), Ok(())) => Ok(outcome),
        }
    }

    fn poll(&self, poll: Poll) -> Poll {
        match &self.cancel {
            Some(listener) => poll.cancel_on(listener.clone()),
            None => poll,
        }
    }

    /// Number of tracked workers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Manager statistics
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            active: self.active.len(),
            ..*self.stats.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_table() {
        assert!(WorkerState::Creating.can_transition(WorkerState::Ready));
        assert!(WorkerState::Ready.can_transition(WorkerState::Running));
        assert!(WorkerState::Running.can_transition(WorkerState::Completed));
        assert!(!WorkerState::Completed.can_transition(WorkerState::Running));
        assert!(!WorkerState::Creating.can_transition(WorkerState::Completed));
    }

    #[test]
    fn handle_ignores_regressions() {
        let handle = WorkerHandle::new(WorkerSpec::new("exp"));
        handle.advance(WorkerState::Ready);
        handle.advance(WorkerState::Completed);
        handle.advance(WorkerState::Running);
        assert_eq!(handle.state(), WorkerState::Completed);
    }
}
