//! Error types for the chaos orchestrator
//!
//! Provides the error taxonomy shared by every experiment:
//! - Target selection failures
//! - Ephemeral worker (helper) failures
//! - State-transition polling timeouts
//! - Cluster/cloud capability failures
//! - Probe failures

use crate::types::TargetId;
use std::fmt;
use std::time::Duration;

/// Result alias used throughout the core
pub type ChaosResultOf<T> = std::result::Result<T, ChaosError>;

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    /// No eligible targets, or a bad affected percentage
    #[error("target selection failed: {reason}")]
    TargetSelection { reason: String },

    /// Ephemeral worker never became ready
    #[error("helper '{worker}' unavailable: {reason}")]
    HelperUnavailable { worker: String, reason: String },

    /// Ephemeral worker ran but failed or overran its deadline
    #[error("helper '{worker}' failed: {cause}")]
    HelperFailed { worker: String, cause: HelperFailure },

    /// A poll exhausted its retries waiting for a state transition
    #[error("timed out waiting for {what} after {attempts} attempts: {last}")]
    StateCheckTimeout {
        what: String,
        attempts: u32,
        last: String,
    },

    /// The underlying cluster/cloud call failed
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// An external probe reported unhealthy
    #[error("{phase} probes failed: {reason}")]
    ProbeFailed {
        phase: crate::types::ProbePhase,
        reason: String,
    },

    /// Invalid experiment configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Abort signal received; the run is being stopped
    #[error("experiment aborted")]
    Aborted,

    /// Orchestrator invariant broken (illegal phase transition, lost task)
    #[error("internal error: {0}")]
    Internal(String),

    /// Error attributed to a specific target
    #[error("target '{target}': {source}")]
    OnTarget {
        target: TargetId,
        #[source]
        source: Box<ChaosError>,
    },
}

impl ChaosError {
    /// Create a target selection error
    #[inline]
    pub fn selection(reason: impl Into<String>) -> Self {
        Self::TargetSelection {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    #[inline]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Attach the offending target to this error
    ///
    /// Already-attributed errors keep their original target.
    #[must_use]
    pub fn on_target(self, target: &TargetId) -> Self {
        match self {
            Self::OnTarget { .. } | Self::Aborted => self,
            other => Self::OnTarget {
                target: target.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Taxonomy kind of this error, looking through target attribution
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TargetSelection { .. } => ErrorKind::TargetSelection,
            Self::HelperUnavailable { .. } => ErrorKind::HelperUnavailable,
            Self::HelperFailed { .. } => ErrorKind::HelperFailed,
            Self::StateCheckTimeout { .. } => ErrorKind::StateCheckTimeout,
            Self::Capability(_) => ErrorKind::Capability,
            Self::ProbeFailed { .. } => ErrorKind::ProbeFailed,
            Self::Config(_) => ErrorKind::Config,
            Self::Aborted => ErrorKind::Aborted,
            Self::Internal(_) => ErrorKind::Internal,
            Self::OnTarget { source, .. } => source.kind(),
        }
    }

    /// Target that caused the failure, when known
    #[must_use]
    pub fn target(&self) -> Option<&TargetId> {
        match self {
            Self::OnTarget { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Innermost error, with target attribution removed
    #[must_use]
    pub fn root(&self) -> &ChaosError {
        match self {
            Self::OnTarget { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if error is worth retrying at the call site
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Capability(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Error taxonomy classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No eligible targets / bad percentage
    TargetSelection,
    /// Worker never became ready
    HelperUnavailable,
    /// Worker failed or overran its deadline
    HelperFailed,
    /// Poll exhausted waiting for a state transition
    StateCheckTimeout,
    /// Cluster/cloud call failed
    Capability,
    /// Probe reported unhealthy
    ProbeFailed,
    /// Invalid configuration
    Config,
    /// Run was aborted
    Aborted,
    /// Orchestrator invariant broken
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code, used in result records
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::TargetSelection => "TARGET_SELECTION_ERROR",
            Self::HelperUnavailable => "HELPER_UNAVAILABLE",
            Self::HelperFailed => "HELPER_FAILED",
            Self::StateCheckTimeout => "STATE_CHECK_TIMEOUT",
            Self::Capability => "CAPABILITY_ERROR",
            Self::ProbeFailed => "PROBE_FAILED",
            Self::Config => "CONFIG_ERROR",
            Self::Aborted => "EXPERIMENT_ABORTED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Why a helper was declared failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperFailure {
    /// Worker reached the terminal `Failed` state
    Terminated { reason: String },
    /// Worker did not finish before its deadline
    DeadlineExceeded { after: Duration },
}

impl fmt::Display for HelperFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated { reason } => write!(f, "terminated with failure: {reason}"),
            Self::DeadlineExceeded { after } => {
                write!(f, "not completed within {}s", after.as_secs())
            }
        }
    }
}

/// Capability (cluster/cloud API) errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct CapabilityError {
    /// Transient vs permanent classification
    pub kind: CapabilityErrorKind,
    /// Operation that failed, e.g. `create_worker`
    pub operation: String,
    /// Provider message
    pub message: String,
}

impl CapabilityError {
    /// Create new capability error
    #[inline]
    pub fn new(
        kind: CapabilityErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Transient failure (network, throttling)
    #[inline]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Transient, operation, message)
    }

    /// Resource does not exist
    #[inline]
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::NotFound, operation, message)
    }

    /// Permanent failure
    #[inline]
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Permanent, operation, message)
    }

    /// Check if the call may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == CapabilityErrorKind::Transient
    }

    /// Check if the resource is missing
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == CapabilityErrorKind::NotFound
    }
}

/// Capability error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityErrorKind {
    /// Network / throttling; may succeed on retry
    Transient,
    /// Resource not found
    NotFound,
    /// Caller lacks permission
    PermissionDenied,
    /// Resource is in a conflicting state
    Conflict,
    /// Any other permanent failure
    Permanent,
}

/// Errors from the bounded retry primitive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError<E> {
    /// All attempts returned an error; carries the last one
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// Cancelled through the abort listener
    #[error("polling cancelled")]
    Cancelled,

    /// Caller-supplied deadline elapsed before success
    #[error("polling deadline elapsed")]
    DeadlineElapsed,

    /// A single attempt exceeded the per-attempt timeout on the final try
    #[error("attempt {attempt} exceeded its {timeout:?} timeout")]
    AttemptTimedOut { attempt: u32, timeout: Duration },
}

impl<E: fmt::Display> PollError<E> {
    /// Convert into a `StateCheckTimeout`/`Aborted` orchestrator error
    ///
    /// `what` names the state being waited for, e.g. "instance i-1 stopped".
    pub fn into_state_check(self, what: impl Into<String>) -> ChaosError {
        match self {
            Self::Exhausted { attempts, last } => ChaosError::StateCheckTimeout {
                what: what.into(),
                attempts,
                last: last.to_string(),
            },
            Self::Cancelled => ChaosError::Aborted,
            Self::DeadlineElapsed => ChaosError::StateCheckTimeout {
                what: what.into(),
                attempts: 0,
                last: "deadline elapsed".to_string(),
            },
            Self::AttemptTimedOut { attempt, timeout } => ChaosError::StateCheckTimeout {
                what: what.into(),
                attempts: attempt,
                last: format!("attempt exceeded {}ms", timeout.as_millis()),
            },
        }
    }

    /// Check if polling gave up because retries ran out
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Check if polling stopped because it was cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chaos_error_display() {
        let err = ChaosError::selection("no candidates");
        assert!(err.to_string().contains("target selection failed"));
    }

    #[test]
    fn on_target_keeps_kind_and_target() {
        let target = TargetId::from("pod-a");
        let err = ChaosError::HelperUnavailable {
            worker: "w".into(),
            reason: "pending".into(),
        }
        .on_target(&target);

        assert_eq!(err.kind(), ErrorKind::HelperUnavailable);
        assert_eq!(err.target(), Some(&target));
        assert!(err.to_string().contains("pod-a"));
    }

    #[test]
    fn on_target_does_not_rewrap() {
        let first = TargetId::from("a");
        let second = TargetId::from("b");
        let err = ChaosError::Aborted.on_target(&first);
        assert!(err.target().is_none());

        let err = ChaosError::config("x").on_target(&first).on_target(&second);
        assert_eq!(err.target(), Some(&first));
    }

    #[test]
    fn capability_retryable() {
        let transient: ChaosError = CapabilityError::transient("stop_instance", "throttled").into();
        let permanent: ChaosError = CapabilityError::permanent("stop_instance", "denied").into();

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(transient.kind(), ErrorKind::Capability);
    }

    #[test]
    fn poll_error_maps_to_state_check() {
        let err: PollError<String> = PollError::Exhausted {
            attempts: 3,
            last: "volume is detaching".into(),
        };
        let mapped = err.into_state_check("volume attached");
        assert_eq!(mapped.kind(), ErrorKind::StateCheckTimeout);
        assert!(mapped.to_string().contains("volume is detaching"));

        let cancelled: PollError<String> = PollError::Cancelled;
        assert_eq!(cancelled.into_state_check("x").kind(), ErrorKind::Aborted);
    }

    #[test]
    fn helper_failure_display() {
        let failure = HelperFailure::DeadlineExceeded {
            after: Duration::from_secs(90),
        };
        assert_eq!(failure.to_string(), "not completed within 90s");
    }
}
