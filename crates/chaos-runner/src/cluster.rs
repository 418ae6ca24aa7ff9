//! In-process simulated cluster
//!
//! Stands in for the cloud and Kubernetes capability boundaries:
//! - Instances that take a while to stop and to start again
//! - Pods placed round-robin on nodes
//! - Helper workers that run for a fixed time, or never start when told to
//!
//! Time is read from the tokio clock, so a paused runtime drives every
//! transition deterministically.

use async_trait::async_trait;
use chaos_core::{
    CapabilityError, ChaosError, Target, TargetKind, TargetSource, WorkerBackend, WorkerPhase,
    WorkerSpec,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Observed instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Instance {
    state: InstanceState,
    settles_at: Instant,
    stops: u32,
}

impl Instance {
    fn running() -> Self {
        Self {
            state: InstanceState::Running,
            settles_at: Instant::now(),
            stops: 0,
        }
    }

    /// Settle any transition whose time has come
    fn observe(&mut self, now: Instant) -> InstanceState {
        if now >= self.settles_at {
            self.state = match self.state {
                InstanceState::Pending => InstanceState::Running,
                InstanceState::Stopping => InstanceState::Stopped,
                settled => settled,
            };
        }
        self.state
    }
}

#[derive(Debug)]
struct Worker {
    created_at: Instant,
    stuck: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    instances: BTreeMap<String, Instance>,
    pods: Vec<Target>,
    workers: HashMap<String, Worker>,
    workers_created: usize,
}

/// Simulated cluster shared by targets, strategies and the worker backend
pub struct SimCluster {
    transition: Duration,
    worker_runtime: Duration,
    stuck_workers: HashSet<usize>,
    state: Mutex<ClusterState>,
}

impl fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimCluster")
            .field("instances", &state.instances.len())
            .field("pods", &state.pods.len())
            .field("workers", &state.workers.len())
            .finish_non_exhaustive()
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    /// Empty cluster; transitions and workers take one second
    #[must_use]
    pub fn new() -> Self {
        Self {
            transition: Duration::from_secs(1),
            worker_runtime: Duration::from_secs(1),
            stuck_workers: HashSet::new(),
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// With `count` running instances named `i-0..count`
    #[must_use]
    pub fn with_instances(self, count: usize) -> Self {
        {
            let mut state = self.state.lock();
            for i in 0..count {
                state.instances.insert(format!("i-{i}"), Instance::running());
            }
        }
        self
    }

    /// With `count` pods spread round-robin over `nodes` nodes
    #[must_use]
    pub fn with_pods(self, count: usize, nodes: usize) -> Self {
        let nodes = nodes.max(1);
        self.state.lock().pods = (0..count)
            .map(|i| Target::new(format!("pod-{i}"), TargetKind::Pod).on_host(format!("node-{}", i % nodes)))
            .collect();
        self
    }

    /// How long an instance takes to stop or start
    #[must_use]
    pub fn with_transition(mut self, transition: Duration) -> Self {
        self.transition = transition;
        self
    }

    /// How long a helper runs before it succeeds
    #[must_use]
    pub fn with_worker_runtime(mut self, runtime: Duration) -> Self {
        self.worker_runtime = runtime;
        self
    }

    /// The worker created at position `index` (0-based) never leaves `Pending`
    #[must_use]
    pub fn with_stuck_worker(mut self, index: usize) -> Self {
        self.stuck_workers.insert(index);
        self
    }

    /// Current state of instance `id`
    ///
    /// # Errors
    /// `NotFound` for an unknown instance
    pub fn instance_state(&self, id: &str) -> Result<InstanceState, CapabilityError> {
        let now = Instant::now();
        self.state
            .lock()
            .instances
            .get_mut(id)
            .map(|instance| instance.observe(now))
            .ok_or_else(|| CapabilityError::not_found("describe_instance", format!("instance {id} not found")))
    }

    /// Begin stopping instance `id`; stopping a stopped instance is a no-op
    ///
    /// # Errors
    /// `NotFound` for an unknown instance
    pub fn stop_instance(&self, id: &str) -> Result<(), CapabilityError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| CapabilityError::not_found("stop_instance", format!("instance {id} not found")))?;

        if matches!(instance.observe(now), InstanceState::Running | InstanceState::Pending) {
            instance.state = InstanceState::Stopping;
            instance.settles_at = now + self.transition;
            instance.stops += 1;
            tracing::debug!(instance = id, "[Sim]: Instance stopping");
        }
        Ok(())
    }

    /// Begin starting instance `id`; starting a running instance is a no-op
    ///
    /// # Errors
    /// `NotFound` for an unknown instance
    pub fn start_instance(&self, id: &str) -> Result<(), CapabilityError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| CapabilityError::not_found("start_instance", format!("instance {id} not found")))?;

        if matches!(instance.observe(now), InstanceState::Stopped | InstanceState::Stopping) {
            instance.state = InstanceState::Pending;
            instance.settles_at = now + self.transition;
            tracing::debug!(instance = id, "[Sim]: Instance starting");
        }
        Ok(())
    }

    /// Every instance id, sorted
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        self.state.lock().instances.keys().cloned().collect()
    }

    /// Instances currently observed running
    #[must_use]
    pub fn running_instances(&self) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .instances
            .iter_mut()
            .filter_map(|(id, instance)| (instance.observe(now) == InstanceState::Running).then(|| id.clone()))
            .collect()
    }

    /// Instances not observed running
    #[must_use]
    pub fn instances_not_running(&self) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .instances
            .iter_mut()
            .filter_map(|(id, instance)| (instance.observe(now) != InstanceState::Running).then(|| id.clone()))
            .collect()
    }

    /// How many times `id` was actually stopped
    #[must_use]
    pub fn stop_count(&self, id: &str) -> u32 {
        self.state.lock().instances.get(id).map_or(0, |i| i.stops)
    }

    /// Pods with their node placement
    #[must_use]
    pub fn pods(&self) -> Vec<Target> {
        self.state.lock().pods.clone()
    }

    /// Helper workers not yet deleted
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Helper workers ever created
    #[must_use]
    pub fn workers_created(&self) -> usize {
        self.state.lock().workers_created
    }
}

#[async_trait]
impl WorkerBackend for SimCluster {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        let name = spec.name();
        if state.workers.contains_key(&name) {
            return Err(CapabilityError::new(
                chaos_core::CapabilityErrorKind::Conflict,
                "create_worker",
                format!("worker {name} already exists"),
            ));
        }
        let index = state.workers_created;
        state.workers_created += 1;
        state.workers.insert(
            name,
            Worker {
                created_at: Instant::now(),
                stuck: self.stuck_workers.contains(&index),
            },
        );
        Ok(())
    }

    async fn worker_phase(&self, name: &str) -> Result<WorkerPhase, CapabilityError> {
        let state = self.state.lock();
        let worker = state
            .workers
            .get(name)
            .ok_or_else(|| CapabilityError::not_found("worker_phase", format!("worker {name} not found")))?;

        Ok(if worker.stuck {
            WorkerPhase::Pending
        } else if worker.created_at.elapsed() < self.worker_runtime {
            WorkerPhase::Running
        } else {
            WorkerPhase::Succeeded
        })
    }

    async fn delete_worker(&self, name: &str) -> Result<(), CapabilityError> {
        match self.state.lock().workers.remove(name) {
            Some(_) => Ok(()),
            None => Err(CapabilityError::not_found("delete_worker", format!("worker {name} not found"))),
        }
    }
}

/// Candidate listing over the simulated cluster
#[derive(Debug, Clone)]
pub struct SimTargets {
    cluster: Arc<SimCluster>,
    kind: TargetKind,
}

impl SimTargets {
    /// List targets of `kind`: running instances or pods
    #[must_use]
    pub fn new(cluster: Arc<SimCluster>, kind: TargetKind) -> Self {
        Self { cluster, kind }
    }
}

#[async_trait]
impl TargetSource for SimTargets {
    async fn list_candidates(&self) -> Result<Vec<Target>, ChaosError> {
        Ok(match self.kind {
            TargetKind::Pod => self.cluster.pods(),
            kind => self
                .cluster
                .running_instances()
                .into_iter()
                .map(|id| Target::new(id, kind))
                .collect(),
        })
    }
}
