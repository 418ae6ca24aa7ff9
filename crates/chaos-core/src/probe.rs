//! Health probe boundary
//!
//! Probes are opaque to the orchestrator: they run at fixed lifecycle points
//! and either pass or return an error that fails the run.

use crate::error::ChaosError;
use crate::types::ProbePhase;
use async_trait::async_trait;

/// Runs the configured probes for a lifecycle point
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Run every probe registered for `phase`
    async fn run_probes(&self, phase: ProbePhase) -> Result<(), ChaosError>;
}

/// Probe runner with nothing registered
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbes;

#[async_trait]
impl ProbeRunner for NoProbes {
    async fn run_probes(&self, phase: ProbePhase) -> Result<(), ChaosError> {
        tracing::debug!(%phase, "[Probe]: No probes configured");
        Ok(())
    }
}
