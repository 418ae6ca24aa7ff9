//! Per-run shared context
//!
//! One `RunContext` exists per experiment run. It is built by the entrypoint
//! and handed to the scheduler and the abort watcher at construction; no
//! run state lives in globals.

use crate::abort::AbortSignal;
use crate::registry::TargetRegistry;
use crate::sink::{ChaosEvent, ResultSink, TracingSink};
use crate::state_machine::PhaseTracker;
use crate::types::ExperimentPhase;
use std::fmt;
use std::sync::Arc;

/// Shared state of one run
#[derive(Clone)]
pub struct RunContext {
    /// Experiment name
    pub experiment: String,
    /// Target status registry
    pub registry: Arc<TargetRegistry>,
    /// Scheduler phase
    pub phase: Arc<PhaseTracker>,
    /// Abort latch for this run
    pub abort: AbortSignal,
    /// Result sink
    pub sink: Arc<dyn ResultSink>,
}

impl RunContext {
    /// Fresh context logging to the tracing sink
    pub fn new(experiment: impl Into<String>, abort: AbortSignal) -> Self {
        Self {
            experiment: experiment.into(),
            registry: Arc::new(TargetRegistry::new()),
            phase: Arc::new(PhaseTracker::new()),
            abort,
            sink: Arc::new(TracingSink),
        }
    }

    /// With result sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Send an event to the sink; failures are only logged
    pub async fn emit(&self, event: ChaosEvent) {
        if let Err(e) = self.sink.record_event(&self.experiment, event).await {
            tracing::warn!(error = %e, "[Warning]: Failed to record event");
        }
    }

    /// Report a phase to the sink; failures are only logged
    pub async fn report_phase(&self, phase: ExperimentPhase) {
        if let Err(e) = self.sink.record_phase(&self.experiment, phase).await {
            tracing::warn!(error = %e, %phase, "[Warning]: Failed to record phase");
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("experiment", &self.experiment)
            .field("phase", &self.phase.snapshot())
            .field("aborted", &self.abort.is_triggered())
            .finish_non_exhaustive()
    }
}
