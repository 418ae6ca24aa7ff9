//! Core types for the orchestrator
//!
//! Defines the fundamental vocabulary shared by every experiment:
//! - Targets and their chaos status tags
//! - Sequence modes and verdicts
//! - Probe and experiment phase markers
//! - Worker identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Opaque target identifier (pod name, instance ID, volume ID, PID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    /// Create a new target identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of resource a target addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Pod,
    Node,
    Instance,
    Volume,
    Database,
    Process,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pod => "pod",
            Self::Node => "node",
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::Database => "database",
            Self::Process => "process",
        };
        f.write_str(s)
    }
}

/// Chaos status tag of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    /// Never (confirmed) injected
    #[default]
    NotInjected,
    /// Fault confirmed started
    Injected,
    /// Resource confirmed restored
    Reverted,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotInjected => "not-injected",
            Self::Injected => "injected",
            Self::Reverted => "reverted",
        };
        f.write_str(s)
    }
}

/// A single addressable resource subject to fault injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Identifier
    pub id: TargetId,
    /// Resource kind
    pub kind: TargetKind,
    /// Host the target lives on (node name, hypervisor), if known
    pub host: Option<String>,
    /// Chaos status tag
    pub status: TargetStatus,
}

impl Target {
    /// Create a not-injected target
    #[inline]
    pub fn new(id: impl Into<TargetId>, kind: TargetKind) -> Self {
        Self {
            id: id.into(),
            kind,
            host: None,
            status: TargetStatus::NotInjected,
        }
    }

    /// With host placement
    #[inline]
    #[must_use]
    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Execution strategy across targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sequence {
    /// One target at a time
    #[default]
    Serial,
    /// All targets concurrently
    Parallel,
    /// Serial or parallel, picked once per run
    Random,
}

impl Sequence {
    /// Resolve `Random` into a concrete mode
    #[must_use]
    pub fn resolve<R: rand::Rng + ?Sized>(self, rng: &mut R) -> Sequence {
        match self {
            Self::Random => {
                if rng.gen_bool(0.5) {
                    Self::Serial
                } else {
                    Self::Parallel
                }
            }
            concrete => concrete,
        }
    }
}

impl FromStr for Sequence {
    type Err = crate::error::ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            "random" => Ok(Self::Random),
            other => Err(crate::error::ChaosError::config(format!(
                "'{other}' sequence is not supported"
            ))),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
            Self::Random => "random",
        };
        f.write_str(s)
    }
}

/// Final run outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// Chaos ran to completion and every check passed
    Passed,
    /// A check or injection step failed
    Failed,
    /// Aborted from outside; neither pass nor fail
    Stopped,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "Pass",
            Self::Failed => "Fail",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle points at which probes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbePhase {
    PreChaos,
    DuringChaos,
    PostChaos,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreChaos => "PreChaos",
            Self::DuringChaos => "DuringChaos",
            Self::PostChaos => "PostChaos",
        };
        f.write_str(s)
    }
}

/// Coarse experiment phases reported to the result sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentPhase {
    PreChaos,
    ChaosInjection,
    PostChaos,
    Completed,
    Aborted,
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Unique worker identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Ulid);

impl WorkerId {
    /// Generate new worker ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
