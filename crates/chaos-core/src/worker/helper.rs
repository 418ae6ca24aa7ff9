//! Helper-backed fault strategy
//!
//! Runs the fault inside an ephemeral helper worker: inject creates it,
//! confirm-started waits for it to be ready, revert waits for it to finish
//! and releases it. Emergency revert and cleanup release without waiting;
//! helpers undo their fault on termination.

use super::backend::{ResourceLimits, WorkerSpec};
use super::manager::{WorkerHandle, WorkerManager};
use crate::config::RetryPolicy;
use crate::error::ChaosError;
use crate::scheduler::FaultStrategy;
use crate::types::{Target, TargetId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// What every helper of one experiment looks like
#[derive(Debug, Clone, Default)]
pub struct HelperTemplate {
    /// Owning experiment, prefix of every helper name
    pub experiment: String,
    /// Helper command
    pub command: Vec<String>,
    /// Resource limits
    pub resources: ResourceLimits,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
}

impl HelperTemplate {
    /// Template for `experiment`
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            ..Self::default()
        }
    }

    fn spec_for(&self, targets: &[Target]) -> WorkerSpec {
        let spec = WorkerSpec::new(&self.experiment)
            .with_targets(targets.iter().map(|t| t.id.clone()))
            .with_command(self.command.clone())
            .with_resources(self.resources)
            .with_labels(&self.labels);
        match targets.first().and_then(|t| t.host.clone()) {
            Some(host) => spec.on_host(host),
            None => spec,
        }
    }
}

/// Fault strategy running one helper per batch
pub struct HelperFault {
    name: String,
    template: HelperTemplate,
    manager: Arc<WorkerManager>,
    ready: RetryPolicy,
    completion_deadline: Duration,
    host_scoped: bool,
    bindings: Mutex<HashMap<TargetId, WorkerHandle>>,
}

impl std::fmt::Debug for HelperFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperFault")
            .field("name", &self.name)
            .field("bound", &self.bindings.lock().len())
            .field("host_scoped", &self.host_scoped)
            .finish_non_exhaustive()
    }
}

impl HelperFault {
    /// Helper strategy; completion deadline defaults to `ready` timeout
    #[must_use]
    pub fn new(template: HelperTemplate, manager: Arc<WorkerManager>, ready: RetryPolicy) -> Self {
        Self {
            name: format!("{}-helper", template.experiment),
            template,
            manager,
            ready,
            completion_deadline: ready.max_sleep(),
            host_scoped: false,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// With completion deadline, usually chaos interval plus check timeout
    #[must_use]
    pub fn with_completion_deadline(mut self, deadline: Duration) -> Self {
        self.completion_deadline = deadline;
        self
    }

    /// One helper per host instead of per target
    #[must_use]
    pub fn host_scoped(mut self, yes: bool) -> Self {
        self.host_scoped = yes;
        self
    }

    /// Underlying worker manager
    #[must_use]
    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// Distinct helpers bound to `targets`
    fn bound(&self, targets: &[Target]) -> Vec<WorkerHandle> {
        let bindings = self.bindings.lock();
        let mut handles: Vec<WorkerHandle> = Vec::new();
        for target in targets {
            if let Some(handle) = bindings.get(&target.id) {
                if !handles.iter().any(|h| h.id == handle.id) {
                    handles.push(handle.clone());
                }
            }
        }
        handles
    }

    fn unbind(&self, targets: &[Target]) {
        let mut bindings = self.bindings.lock();
        for target in targets {
            bindings.remove(&target.id);
        }
    }

    fn missing(&self, targets: &[Target]) -> Option<TargetId> {
        let bindings = self.bindings.lock();
        targets
            .iter()
            .find(|t| !bindings.contains_key(&t.id))
            .map(|t| t.id.clone())
    }
}

#[async_trait]
impl FaultStrategy for HelperFault {
    fn name(&self) -> &str {
        &self.name
    }

    fn host_scoped(&self) -> bool {
        self.host_scoped
    }

    async fn inject(&self, targets: &[Target]) -> Result<(), ChaosError> {
        let handle = self.manager.create(self.template.spec_for(targets)).await?;
        let mut bindings = self.bindings.lock();
        for target in targets {
            bindings.insert(target.id.clone(), handle.clone());
        }
        Ok(())
    }

    async fn confirm_started(&self, targets: &[Target]) -> Result<(), ChaosError> {
        if let Some(id) = self.missing(targets) {
            return Err(ChaosError::HelperUnavailable {
                worker: String::new(),
                reason: format!("no helper bound to target {id}"),
            });
        }
        for handle in self.bound(targets) {
            match self.manager.await_ready(&handle, self.ready).await {
                Ok(()) => {}
                // still bound, so the abort path can release it
                Err(ChaosError::Aborted) => return Err(ChaosError::Aborted),
                Err(e) => {
                    self.unbind(targets);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        let mut first = None;
        for handle in self.bound(targets) {
            let completed = self
                .manager
                .await_completion(&handle, self.completion_deadline, self.ready.delay)
                .await;
            let released = self.manager.cleanup(&handle).await;
            if let Err(e) = completed.map(|_| ()).and(released) {
                first.get_or_insert(e);
            }
        }
        self.unbind(targets);
        first.map_or(Ok(()), Err)
    }

    async fn confirm_reverted(&self, targets: &[Target]) -> Result<(), ChaosError> {
        match self.bound(targets).first() {
            Some(handle) => Err(ChaosError::HelperUnavailable {
                worker: handle.name.clone(),
                reason: format!("helper still bound in {} state", handle.state()),
            }),
            None => Ok(()),
        }
    }

    async fn emergency_revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        let mut first = None;
        for handle in self.bound(targets) {
            if let Err(e) = self.manager.cleanup(&handle).await {
                first.get_or_insert(e);
            }
        }
        if first.is_none() {
            self.unbind(targets);
        }
        first.map_or(Ok(()), Err)
    }

    async fn cleanup(&self) -> Result<(), ChaosError> {
        let result = self.manager.cleanup_all().await;
        if result.is_ok() {
            self.bindings.lock().clear();
        }
        result
    }
}
