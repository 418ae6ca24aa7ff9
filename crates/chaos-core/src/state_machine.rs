//! Scheduler phase state machine
//!
//! ```text
//! Idle -> RampingUp -> Injecting <-> Waiting -> RampingDown -> Done
//!                         |             |
//!                         +--> Aborting <+   (from any non-terminal phase)
//! ```
//!
//! Once `Aborting` is entered the scheduler can no longer move the phase;
//! every further transition it attempts fails with `PhaseError::Aborted`.

use crate::error::ChaosError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Scheduler lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerPhase {
    Idle,
    RampingUp,
    Injecting,
    Waiting,
    RampingDown,
    Done,
    Aborting,
    Failed,
}

impl SchedulerPhase {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phase transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// Abort already latched
    #[error("phase is locked by an abort")]
    Aborted,

    /// Transition not in the allowed table
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition {
        from: SchedulerPhase,
        to: SchedulerPhase,
    },
}

impl From<PhaseError> for ChaosError {
    fn from(err: PhaseError) -> Self {
        match err {
            PhaseError::Aborted => ChaosError::Aborted,
            illegal @ PhaseError::IllegalTransition { .. } => ChaosError::Internal(illegal.to_string()),
        }
    }
}

/// Validates a phase transition.
///
/// Illegal transitions return an error; the `strict-debug` feature turns them
/// into panics instead.
///
/// # Errors
/// - `PhaseError::Aborted` when `from` is `Aborting`
/// - `PhaseError::IllegalTransition` for anything not in `allowed_transitions`
pub fn validate_transition(from: SchedulerPhase, to: SchedulerPhase) -> Result<(), PhaseError> {
    if from == SchedulerPhase::Aborting {
        return Err(PhaseError::Aborted);
    }
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal phase transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(PhaseError::IllegalTransition { from, to })
    }
}

/// Phases reachable from `from`
#[must_use]
pub fn allowed_transitions(from: SchedulerPhase) -> Vec<SchedulerPhase> {
    use SchedulerPhase::{Aborting, Done, Failed, Idle, Injecting, RampingDown, RampingUp, Waiting};
    match from {
        Idle => vec![RampingUp, Failed, Aborting],
        RampingUp => vec![Injecting, RampingDown, Failed, Aborting],
        Injecting => vec![Injecting, Waiting, RampingDown, Failed, Aborting],
        Waiting => vec![Injecting, RampingDown, Failed, Aborting],
        RampingDown => vec![Done, Failed, Aborting],
        Aborting | Done | Failed => vec![],
    }
}

fn allowed(from: SchedulerPhase, to: SchedulerPhase) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    /// Current phase
    pub phase: SchedulerPhase,
    /// Injection round, 1-based (0 before the first round)
    pub round: u32,
}

/// Shared, observable phase cell
///
/// The scheduler drives normal transitions; the abort watcher is the only
/// writer of `Aborting`.
#[derive(Debug)]
pub struct PhaseTracker {
    tx: watch::Sender<PhaseSnapshot>,
}

impl PhaseTracker {
    /// Tracker starting in `Idle`
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PhaseSnapshot {
            phase: SchedulerPhase::Idle,
            round: 0,
        });
        Self { tx }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> PhaseSnapshot {
        *self.tx.borrow()
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        self.snapshot().phase
    }

    /// Observe phase changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PhaseSnapshot> {
        self.tx.subscribe()
    }

    /// Move to `to`
    ///
    /// # Errors
    /// See [`validate_transition`]
    pub fn transition(&self, to: SchedulerPhase) -> Result<(), PhaseError> {
        self.update(to, None)
    }

    /// Enter `Injecting` for round `round`
    ///
    /// # Errors
    /// See [`validate_transition`]
    pub fn start_round(&self, round: u32) -> Result<(), PhaseError> {
        self.update(SchedulerPhase::Injecting, Some(round))
    }

    /// Latch `Aborting`
    ///
    /// Returns `false` if the phase was already terminal or aborting, in which
    /// case it is left as is.
    pub fn enter_aborting(&self) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.phase.is_terminal() || snap.phase == SchedulerPhase::Aborting {
                return false;
            }
            tracing::warn!(from = %snap.phase, round = snap.round, "[Abort]: Locking scheduler phase");
            snap.phase = SchedulerPhase::Aborting;
            true
        })
    }

    /// Whether the abort latch is set
    #[inline]
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.phase() == SchedulerPhase::Aborting
    }

    fn update(&self, to: SchedulerPhase, round: Option<u32>) -> Result<(), PhaseError> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|snap| match validate_transition(snap.phase, to) {
            Ok(()) => {
                snap.phase = to;
                if let Some(round) = round {
                    snap.round = round;
                }
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
