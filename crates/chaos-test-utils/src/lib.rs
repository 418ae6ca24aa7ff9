//! Testing utilities for the chaos orchestrator workspace
//!
//! Scripted fakes for every collaborator boundary of the core: fault
//! strategy, worker backend, result sink and probes. Each fake records what
//! it was asked to do so tests can assert on ordering and counts.

#![allow(missing_docs)]

use async_trait::async_trait;
use chaos_core::{
    CapabilityError, ChaosError, ChaosEvent, ChaosResult, ExperimentConfig, ExperimentPhase,
    FaultStrategy, ProbePhase, ProbeRunner, ResultSink, Target, TargetId, TargetKind,
    TargetSource, WorkerBackend, WorkerPhase, WorkerSpec,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// `n` pods named `pod-0..n`
pub fn pods(n: usize) -> Vec<Target> {
    (0..n)
        .map(|i| Target::new(format!("pod-{i}"), TargetKind::Pod))
        .collect()
}

/// `n` instances named `i-0..n`
pub fn instances(n: usize) -> Vec<Target> {
    (0..n)
        .map(|i| Target::new(format!("i-{i}"), TargetKind::Instance))
        .collect()
}

/// Config with 1s checks, no ramp
pub fn fast_config(duration: u64, interval: u64) -> ExperimentConfig {
    ExperimentConfig::new()
        .with_name("test-exp")
        .with_duration(duration)
        .with_interval(chaos_core::ChaosInterval::fixed(interval))
        .with_checks(5, 1)
        .with_affected_percentage(100)
}

// ---------------------------------------------------------------------------
// Fault strategy
// ---------------------------------------------------------------------------

/// Strategy operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Inject,
    ConfirmStarted,
    Revert,
    ConfirmReverted,
    EmergencyRevert,
    Cleanup,
}

/// One recorded strategy call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub targets: Vec<TargetId>,
    /// Time since the strategy was created, at call entry
    pub at: Duration,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Call>,
    faulted: HashSet<TargetId>,
    /// Effective reverts: a revert that actually removed a fault
    reverts: HashMap<TargetId, u32>,
}

/// Scripted, recording fault strategy
///
/// Reverting a target without an active fault is a no-op.
#[derive(Debug)]
pub struct FakeStrategy {
    started: Instant,
    inject_delay: Duration,
    confirm_delay: Duration,
    revert_delay: Duration,
    host_scoped: bool,
    resample: bool,
    failures: HashMap<(Op, TargetId), String>,
    state: Mutex<FakeState>,
}

impl Default for FakeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStrategy {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inject_delay: Duration::ZERO,
            confirm_delay: Duration::ZERO,
            revert_delay: Duration::ZERO,
            host_scoped: false,
            resample: false,
            failures: HashMap::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_inject_delay(mut self, delay: Duration) -> Self {
        self.inject_delay = delay;
        self
    }

    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    pub fn with_revert_delay(mut self, delay: Duration) -> Self {
        self.revert_delay = delay;
        self
    }

    pub fn host_scoped(mut self) -> Self {
        self.host_scoped = true;
        self
    }

    pub fn resampling(mut self) -> Self {
        self.resample = true;
        self
    }

    /// Fail `op` whenever its batch contains `target`
    pub fn fail_on(mut self, op: Op, target: impl Into<TargetId>, reason: impl Into<String>) -> Self {
        self.failures.insert((op, target.into()), reason.into());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Calls of one kind
    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Operations touching `target`, in order
    pub fn ops_for(&self, target: &str) -> Vec<Op> {
        self.calls()
            .into_iter()
            .filter(|c| c.targets.iter().any(|t| t.as_str() == target))
            .map(|c| c.op)
            .collect()
    }

    /// Number of reverts that actually removed a fault from `target`
    pub fn effective_reverts(&self, target: &str) -> u32 {
        self.state
            .lock()
            .reverts
            .get(&TargetId::from(target))
            .copied()
            .unwrap_or(0)
    }

    /// Targets currently carrying a fault
    pub fn faulted(&self) -> Vec<TargetId> {
        let mut faulted: Vec<_> = self.state.lock().faulted.iter().cloned().collect();
        faulted.sort();
        faulted
    }

    fn record(&self, op: Op, targets: &[Target]) -> Result<(), ChaosError> {
        self.state.lock().calls.push(Call {
            op,
            targets: targets.iter().map(|t| t.id.clone()).collect(),
            at: self.started.elapsed(),
        });
        for target in targets {
            if let Some(reason) = self.failures.get(&(op, target.id.clone())) {
                return Err(CapabilityError::permanent(format!("{op:?}"), reason.clone()).into());
            }
        }
        Ok(())
    }

    fn remove_faults(&self, targets: &[Target]) {
        let mut state = self.state.lock();
        for target in targets {
            if state.faulted.remove(&target.id) {
                *state.reverts.entry(target.id.clone()).or_default() += 1;
            }
        }
    }
}

#[async_trait]
impl FaultStrategy for FakeStrategy {
    fn name(&self) -> &str {
        "fake"
    }

    fn host_scoped(&self) -> bool {
        self.host_scoped
    }

    fn resample_each_round(&self) -> bool {
        self.resample
    }

    async fn inject(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.record(Op::Inject, targets)?;
        sleep(self.inject_delay).await;
        let mut state = self.state.lock();
        for target in targets {
            state.faulted.insert(target.id.clone());
        }
        Ok(())
    }

    async fn confirm_started(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.record(Op::ConfirmStarted, targets)?;
        sleep(self.confirm_delay).await;
        Ok(())
    }

    async fn revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.record(Op::Revert, targets)?;
        sleep(self.revert_delay).await;
        self.remove_faults(targets);
        Ok(())
    }

    async fn confirm_reverted(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.record(Op::ConfirmReverted, targets)
    }

    async fn emergency_revert(&self, targets: &[Target]) -> Result<(), ChaosError> {
        self.record(Op::EmergencyRevert, targets)?;
        self.remove_faults(targets);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ChaosError> {
        self.record(Op::Cleanup, &[])
    }
}

/// Target source that returns a new generation of pods on every call
#[derive(Debug)]
pub struct RotatingPods {
    count: usize,
    generation: Mutex<u32>,
}

impl RotatingPods {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            generation: Mutex::new(0),
        }
    }

    pub fn generations(&self) -> u32 {
        *self.generation.lock()
    }
}

#[async_trait]
impl TargetSource for RotatingPods {
    async fn list_candidates(&self) -> Result<Vec<Target>, ChaosError> {
        let generation = {
            let mut g = self.generation.lock();
            *g += 1;
            *g
        };
        Ok((0..self.count)
            .map(|i| Target::new(format!("pod-g{generation}-{i}"), TargetKind::Pod))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Worker backend
// ---------------------------------------------------------------------------

/// How a scripted worker behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerScript {
    /// `Pending` for `pending` polls, `Running` for `running` polls, then succeeds
    Succeeds { pending: u32, running: u32 },
    /// Running, then fails with `reason`
    Fails { running: u32, reason: String },
    /// Stuck in `Pending`
    NeverReady,
    /// Runs forever
    NeverFinishes,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self::Succeeds {
            pending: 0,
            running: 1,
        }
    }
}

#[derive(Debug)]
struct FakeWorker {
    script: WorkerScript,
    polls: u32,
}

impl FakeWorker {
    fn phase(&mut self) -> WorkerPhase {
        let poll = self.polls;
        self.polls += 1;
        match &self.script {
            WorkerScript::Succeeds { pending, running } => {
                if poll < *pending {
                    WorkerPhase::Pending
                } else if poll < pending + running {
                    WorkerPhase::Running
                } else {
                    WorkerPhase::Succeeded
                }
            }
            WorkerScript::Fails { running, reason } => {
                if poll < *running {
                    WorkerPhase::Running
                } else {
                    WorkerPhase::Failed {
                        reason: reason.clone(),
                    }
                }
            }
            WorkerScript::NeverReady => WorkerPhase::Pending,
            WorkerScript::NeverFinishes => WorkerPhase::Running,
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    created: Vec<WorkerSpec>,
    live: HashMap<String, FakeWorker>,
    deleted: Vec<String>,
}

/// Scripted worker backend
///
/// The n-th created worker follows the script registered for `n`, or the
/// default script.
#[derive(Debug, Default)]
pub struct FakeWorkerBackend {
    default_script: WorkerScript,
    scripts: HashMap<usize, WorkerScript>,
    fail_create: bool,
    create_delay: Duration,
    phase_delay: Duration,
    state: Mutex<BackendState>,
}

impl FakeWorkerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, script: WorkerScript) -> Self {
        self.default_script = script;
        self
    }

    /// Script for the worker created at position `index` (0-based)
    pub fn with_script(mut self, index: usize, script: WorkerScript) -> Self {
        self.scripts.insert(index, script);
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// The worker exists on the platform immediately, but the create call
    /// only returns after `delay`
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Every status call takes `delay`
    pub fn with_phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = delay;
        self
    }

    pub fn created(&self) -> Vec<WorkerSpec> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }
}

#[async_trait]
impl WorkerBackend for FakeWorkerBackend {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), CapabilityError> {
        if self.fail_create {
            return Err(CapabilityError::transient("create_worker", "api server unavailable"));
        }
        {
            let mut state = self.state.lock();
            let index = state.created.len();
            let script = self
                .scripts
                .get(&index)
                .cloned()
                .unwrap_or_else(|| self.default_script.clone());
            state.created.push(spec.clone());
            state.live.insert(spec.name(), FakeWorker { script, polls: 0 });
        }
        sleep(self.create_delay).await;
        Ok(())
    }

    async fn worker_phase(&self, name: &str) -> Result<WorkerPhase, CapabilityError> {
        sleep(self.phase_delay).await;
        match self.state.lock().live.get_mut(name) {
            Some(worker) => Ok(worker.phase()),
            None => Err(CapabilityError::not_found("worker_phase", format!("{name} not found"))),
        }
    }

    async fn delete_worker(&self, name: &str) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        match state.live.remove(name) {
            Some(_) => {
                state.deleted.push(name.to_string());
                Ok(())
            }
            None => Err(CapabilityError::not_found("delete_worker", format!("{name} not found"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Sink and probes
// ---------------------------------------------------------------------------

/// Result sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    phases: Mutex<Vec<ExperimentPhase>>,
    events: Mutex<Vec<ChaosEvent>>,
    results: Mutex<Vec<ChaosResult>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phases(&self) -> Vec<ExperimentPhase> {
        self.phases.lock().clone()
    }

    pub fn events(&self) -> Vec<ChaosEvent> {
        self.events.lock().clone()
    }

    pub fn results(&self) -> Vec<ChaosResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn record_phase(&self, _experiment: &str, phase: ExperimentPhase) -> Result<(), ChaosError> {
        self.phases.lock().push(phase);
        Ok(())
    }

    async fn record_event(&self, _experiment: &str, event: ChaosEvent) -> Result<(), ChaosError> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn record_result(&self, result: &ChaosResult) -> Result<(), ChaosError> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}

/// Probe runner that records phases and fails on request
#[derive(Debug, Default)]
pub struct ScriptedProbes {
    fail_on: Option<ProbePhase>,
    runs: Mutex<Vec<ProbePhase>>,
}

impl ScriptedProbes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(phase: ProbePhase) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(phase),
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> Vec<ProbePhase> {
        self.runs.lock().clone()
    }

    pub fn count(&self, phase: ProbePhase) -> usize {
        self.runs.lock().iter().filter(|p| **p == phase).count()
    }
}

#[async_trait]
impl ProbeRunner for ScriptedProbes {
    async fn run_probes(&self, phase: ProbePhase) -> Result<(), ChaosError> {
        self.runs.lock().push(phase);
        if self.fail_on == Some(phase) {
            return Err(ChaosError::ProbeFailed {
                phase,
                reason: "probe reported unhealthy".to_string(),
            });
        }
        Ok(())
    }
}
