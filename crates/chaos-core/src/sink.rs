//! Result sink boundary
//!
//! Receives the phase log, the event stream and the final verdict of a run.
//! Sink failures are logged and never change the outcome of the run.

use crate::abort::AbortReport;
use crate::error::ChaosError;
use crate::types::{ExperimentPhase, Target, TargetId, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    /// Injection round started
    ChaosInject,
    /// Final verdict summary
    Summary,
    /// Abort received
    Abort,
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventSeverity {
    #[default]
    Normal,
    Warning,
}

/// A single experiment event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosEvent {
    /// Reason code
    pub reason: EventReason,
    /// Human-readable message
    pub message: String,
    /// Severity
    pub severity: EventSeverity,
    /// When it happened
    pub at: DateTime<Utc>,
}

impl ChaosEvent {
    /// Normal-severity event stamped now
    pub fn new(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            severity: EventSeverity::Normal,
            at: Utc::now(),
        }
    }

    /// Mark as warning
    #[must_use]
    pub fn warning(mut self) -> Self {
        self.severity = EventSeverity::Warning;
        self
    }
}

/// Final record of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosResult {
    /// Experiment name
    pub experiment: String,
    /// Pass / Fail / Stopped
    pub verdict: Verdict,
    /// Last experiment phase reached
    pub phase: ExperimentPhase,
    /// Failure description
    pub fail_step: Option<String>,
    /// Taxonomy code of the failure
    pub error_code: Option<String>,
    /// Target blamed for the failure
    pub failed_target: Option<TargetId>,
    /// Every target the run touched, with final status
    pub targets: Vec<Target>,
    /// Injection rounds started
    pub rounds: u32,
    /// Abort handling summary, for stopped runs
    pub abort: Option<AbortReport>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

impl ChaosResult {
    /// Process exit code for this verdict
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            Verdict::Passed => 0,
            Verdict::Failed => 1,
            Verdict::Stopped => 2,
        }
    }
}

/// Destination for phase updates, events and verdicts
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Experiment moved to `phase`
    async fn record_phase(&self, experiment: &str, phase: ExperimentPhase) -> Result<(), ChaosError>;

    /// Append an event
    async fn record_event(&self, experiment: &str, event: ChaosEvent) -> Result<(), ChaosError>;

    /// Store the final result
    async fn record_result(&self, result: &ChaosResult) -> Result<(), ChaosError>;
}

/// Sink that writes everything to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    async fn record_phase(&self, experiment: &str, phase: ExperimentPhase) -> Result<(), ChaosError> {
        tracing::info!(experiment, %phase, "[Status]: Experiment phase updated");
        Ok(())
    }

    async fn record_event(&self, experiment: &str, event: ChaosEvent) -> Result<(), ChaosError> {
        match event.severity {
            EventSeverity::Normal => {
                tracing::info!(experiment, reason = ?event.reason, "{}", event.message);
            }
            EventSeverity::Warning => {
                tracing::warn!(experiment, reason = ?event.reason, "{}", event.message);
            }
        }
        Ok(())
    }

    async fn record_result(&self, result: &ChaosResult) -> Result<(), ChaosError> {
        tracing::info!(
            experiment = %result.experiment,
            verdict = %result.verdict,
            rounds = result.rounds,
            fail_step = result.fail_step.as_deref().unwrap_or(""),
            "[Verdict]: Experiment finished"
        );
        Ok(())
    }
}
