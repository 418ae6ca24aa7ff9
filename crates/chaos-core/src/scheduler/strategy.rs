//! Fault strategy and target source seams
//!
//! A fault strategy is the per-experiment half of an injection: it knows how
//! to start a fault on a batch of targets, how to tell that it has started,
//! and how to undo it. The scheduler owns pacing, ordering and bookkeeping.

use crate::error::ChaosError;
use crate::types::Target;
use async_trait::async_trait;

/// Experiment-specific fault operations
///
/// Every method takes a batch. Serial runs pass single-element batches;
/// parallel runs pass one batch per target, or one per host when
/// [`host_scoped`](Self::host_scoped) is set.
///
/// Self-healing faults (pod or process kill) have nothing to undo; their
/// `revert` waits for recovery and `confirm_reverted` checks it.
#[async_trait]
pub trait FaultStrategy: Send + Sync {
    /// Name used in events and logs
    fn name(&self) -> &str;

    /// Batch parallel targets by host (one worker per node)
    fn host_scoped(&self) -> bool {
        false
    }

    /// Re-list and re-select targets before every round after the first
    fn resample_each_round(&self) -> bool {
        false
    }

    /// Issue the fault
    async fn inject(&self, targets: &[Target]) -> Result<(), ChaosError>;

    /// Confirm the fault took effect
    async fn confirm_started(&self, targets: &[Target]) -> Result<(), ChaosError>;

    /// Undo the fault
    async fn revert(&self, targets: &[Target]) -> Result<(), ChaosError>;

    /// Confirm the resource is restored
    async fn confirm_reverted(&self, targets: &[Target]) -> Result<(), ChaosError>;

    /// Undo the fault as fast as possible (abort, failed round)
    ///
    /// Defaults to `revert` followed by `confirm_reverted`.
    async fn emergency_revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.revert(targets).await?;
        self.confirm_reverted(targets).await
    }

    /// Release anything the strategy still holds
    async fn cleanup(&self) -> Result<(), ChaosError> {
        Ok(())
    }
}

/// Source of injection candidates
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// List every eligible candidate
    async fn list_candidates(&self) -> Result<Vec<Target>, ChaosError>;
}

/// Fixed candidate list
#[derive(Debug, Clone, Default)]
pub struct StaticTargets(pub Vec<Target>);

#[async_trait]
impl TargetSource for StaticTargets {
    async fn list_candidates(&self) -> Result<Vec<Target>, ChaosError> {
        Ok(self.0.clone())
    }
}
