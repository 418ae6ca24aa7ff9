//! Worker specs and the platform capability that runs them

use crate::error::CapabilityError;
use crate::types::TargetId;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RUN_ID_LEN: usize = 6;

/// Fresh run identifier: six random lowercase alphanumerics
#[must_use]
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RUN_ID_LEN)
        .map(|_| char::from(RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())]))
        .collect()
}

/// Resource limits for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit in millicores
    pub cpu_millicores: Option<u32>,
    /// Memory limit in MiB
    pub memory_mib: Option<u32>,
}

/// Everything needed to create one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Owning experiment
    pub experiment: String,
    /// Unique per worker
    pub run_id: String,
    /// Targets the worker acts on
    pub targets: Vec<TargetId>,
    /// Host to pin the worker to
    pub host: Option<String>,
    /// Entry command
    pub command: Vec<String>,
    /// Resource limits
    pub resources: ResourceLimits,
    /// Labels, including `app=<name>`
    pub labels: BTreeMap<String, String>,
}

impl WorkerSpec {
    /// Spec with a freshly generated run id
    pub fn new(experiment: impl Into<String>) -> Self {
        let experiment = experiment.into();
        let run_id = generate_run_id();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), format!("{experiment}-helper-{run_id}"));
        labels.insert("name".to_string(), format!("{experiment}-helper"));
        Self {
            experiment,
            run_id,
            targets: Vec::new(),
            host: None,
            command: Vec::new(),
            resources: ResourceLimits::default(),
            labels,
        }
    }

    /// Worker name, `<experiment>-helper-<run-id>`
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-helper-{}", self.experiment, self.run_id)
    }

    /// Selector label matching only this worker
    #[must_use]
    pub fn app_label(&self) -> String {
        format!("app={}", self.name())
    }

    /// With targets
    #[must_use]
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = TargetId>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    /// Pinned to host
    #[must_use]
    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// With command
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// With resource limits
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// With extra labels; the `app` label cannot be overridden
    #[must_use]
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        for (k, v) in labels {
            if k != "app" {
                self.labels.insert(k.clone(), v.clone());
            }
        }
        self
    }
}

/// Phase reported by the platform for a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
}

impl WorkerPhase {
    /// Past `Pending`
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// `Succeeded` or `Failed`
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Running => f.write_str("Running"),
            Self::Succeeded => f.write_str("Succeeded"),
            Self::Failed { reason } => write!(f, "Failed ({reason})"),
        }
    }
}

/// Platform capability for ephemeral workers
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Create the worker described by `spec`, named `spec.name()`
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), CapabilityError>;

    /// Current phase of worker `name`
    async fn worker_phase(&self, name: &str) -> Result<WorkerPhase, CapabilityError>;

    /// Delete worker `name`
    ///
    /// A `NotFound` error is treated as success by the manager.
    async fn delete_worker(&self, name: &str) -> Result<(), CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_lowercase_alphanumerics() {
        for _ in 0..64 {
            let id = generate_run_id();
            assert_eq!(id.len(), RUN_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn spec_naming_and_labels() {
        let mut extra = BTreeMap::new();
        extra.insert("app".to_string(), "hijack".to_string());
        extra.insert("team".to_string(), "sre".to_string());

        let spec = WorkerSpec::new("disk-fill").with_labels(&extra);
        let name = spec.name();

        assert!(name.starts_with("disk-fill-helper-"));
        assert_eq!(spec.labels.get("app"), Some(&name));
        assert_eq!(spec.app_label(), format!("app={name}"));
        assert_eq!(spec.labels.get("team").map(String::as_str), Some("sre"));
    }

    #[test]
    fn fresh_specs_do_not_collide() {
        let a = WorkerSpec::new("exp");
        let b = WorkerSpec::new("exp");
        assert_ne!(a.run_id, b.run_id);
    }
}
