//! Instance stop fault
//!
//! Stops the selected instances and starts them again, confirming each
//! transition by polling the instance state.

use crate::cluster::{InstanceState, SimCluster};
use async_trait::async_trait;
use chaos_core::{AbortListener, ChaosError, FaultStrategy, Poll, RetryPolicy, Target};
use std::sync::Arc;

/// Stop/start fault over simulated instances
#[derive(Debug, Clone)]
pub struct InstanceStop {
    cluster: Arc<SimCluster>,
    checks: RetryPolicy,
    cancel: Option<AbortListener>,
}

impl InstanceStop {
    /// Fault confirming every transition with `checks`
    #[must_use]
    pub fn new(cluster: Arc<SimCluster>, checks: RetryPolicy) -> Self {
        Self {
            cluster,
            checks,
            cancel: None,
        }
    }

    /// Stop regular state checks early once `listener` fires
    ///
    /// Emergency reverts always run their checks to the end.
    #[must_use]
    pub fn cancel_on(mut self, listener: AbortListener) -> Self {
        self.cancel = Some(listener);
        self
    }

    async fn wait_for(&self, targets: &[Target], want: InstanceState, cancellable: bool) -> Result<(), ChaosError> {
        for target in targets {
            let mut poll = Poll::from_policy(self.checks);
            if let (true, Some(listener)) = (cancellable, &self.cancel) {
                poll = poll.cancel_on(listener.clone());
            }

            let cluster = &self.cluster;
            let id = target.id.as_str();
            poll.until(|_| async move {
                match cluster.instance_state(id) {
                    Ok(state) if state == want => Ok(()),
                    Ok(state) => Err(format!("instance is in {state} state")),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await
            .map_err(|e| e.into_state_check(format!("instance {id} {want}")))?;

            tracing::info!(target_id = %target.id, state = %want, "[Status]: Instance reached the desired state");
        }
        Ok(())
    }

    fn start_all(&self, targets: &[Target]) -> Result<(), ChaosError> {
        for target in targets {
            tracing::info!(target_id = %target.id, "[Chaos]: Starting the instance");
            self.cluster.start_instance(target.id.as_str())?;
        }
        Ok(())
    }
}

#[async_trait]
impl FaultStrategy for InstanceStop {
    fn name(&self) -> &str {
        "instance-stop"
    }

    async fn inject(&self, targets: &[Target]) -> Result<(), ChaosError> {
        for target in targets {
            tracing::info!(target_id = %target.id, "[Chaos]: Stopping the instance");
            self.cluster.stop_instance(target.id.as_str())?;
        }
        Ok(())
    }

    async fn confirm_started(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.wait_for(targets, InstanceState::Stopped, true).await
    }

    async fn revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.start_all(targets)
    }

    async fn confirm_reverted(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.wait_for(targets, InstanceState::Running, true).await
    }

    async fn emergency_revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.start_all(targets)?;
        self.wait_for(targets, InstanceState::Running, false).await
    }
}
