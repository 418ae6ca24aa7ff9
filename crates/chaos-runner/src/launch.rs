//! Wiring one experiment against the simulated cluster

use crate::cluster::{SimCluster, SimTargets};
use crate::faults::InstanceStop;
use chaos_core::{
    AbortSignal, ChaosError, Experiment, ExperimentConfig, FaultStrategy, HelperFault,
    HelperTemplate, TargetKind, TargetSelector, WorkerManager,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Which fault the runner drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Stop and start instances
    #[default]
    Instance,
    /// Run helper workers against pods, one per node
    Helper,
}

impl FromStr for Mode {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instance" => Ok(Self::Instance),
            "helper" => Ok(Self::Helper),
            other => Err(ChaosError::config(format!("'{other}' mode is not supported"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instance => "instance",
            Self::Helper => "helper",
        })
    }
}

/// Shape of the simulated cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub mode: Mode,
    /// Instances or pods to create
    pub targets: usize,
    /// Nodes the pods are spread over
    pub nodes: usize,
    /// Index of a helper worker that never becomes ready
    pub fail_ready: Option<usize>,
    /// Instance stop/start time
    pub transition: Duration,
    /// Fixed selector seed
    pub seed: Option<u64>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Instance,
            targets: 3,
            nodes: 2,
            fail_ready: None,
            transition: Duration::from_secs(1),
            seed: None,
        }
    }
}

/// An experiment ready to run, and the cluster it runs against
#[derive(Debug)]
pub struct Launch {
    pub cluster: Arc<SimCluster>,
    pub experiment: Experiment,
}

/// Build the cluster, fault strategy and experiment for `config`
///
/// # Errors
/// `ChaosError::Config` when no retry policy can be derived from `config`
pub fn prepare(config: ExperimentConfig, options: &LaunchOptions, abort: &AbortSignal) -> Result<Launch, ChaosError> {
    let checks = config.retry_policy()?;
    let runtime = config.chaos_interval.max_wait();

    let mut cluster = SimCluster::new()
        .with_transition(options.transition)
        .with_worker_runtime(runtime);
    if let Some(index) = options.fail_ready {
        cluster = cluster.with_stuck_worker(index);
    }

    let (cluster, strategy, kind): (Arc<SimCluster>, Arc<dyn FaultStrategy>, TargetKind) = match options.mode {
        Mode::Instance => {
            let cluster = Arc::new(cluster.with_instances(options.targets));
            let fault = InstanceStop::new(Arc::clone(&cluster), checks).cancel_on(abort.listener());
            (cluster, Arc::new(fault), TargetKind::Instance)
        }
        Mode::Helper => {
            let cluster = Arc::new(cluster.with_pods(options.targets, options.nodes));
            let manager = Arc::new(
                WorkerManager::new(cluster.clone(), config.cleanup_policy).cancel_on(abort.listener()),
            );
            let template = HelperTemplate {
                command: vec!["stress-ng".to_string(), "--cpu".to_string(), "1".to_string()],
                labels: config.worker_labels.clone(),
                ..HelperTemplate::new(&config.experiment_name)
            };
            let fault = HelperFault::new(template, manager, checks)
                .with_completion_deadline(runtime + checks.max_sleep())
                .host_scoped(true);
            (cluster, Arc::new(fault), TargetKind::Pod)
        }
    };

    tracing::info!(mode = %options.mode, targets = options.targets, "[Info]: Prepared simulated cluster");

    let source = Arc::new(SimTargets::new(Arc::clone(&cluster), kind));
    let mut experiment = Experiment::new(config, strategy, source);
    if let Some(seed) = options.seed {
        experiment = experiment.with_selector(TargetSelector::new(seed));
    }

    Ok(Launch { cluster, experiment })
}

/// Trigger `signal` after `after`
pub fn abort_after(signal: &AbortSignal, after: Duration) -> JoinHandle<()> {
    let signal = signal.clone();
    tokio::spawn(async move {
        sleep(after).await;
        if signal.trigger() {
            tracing::warn!(after_secs = after.as_secs(), "[Abort]: Abort deadline reached");
        }
    })
}
