//! Chaos Runner - experiments against a simulated cluster
//!
//! Wires [`chaos_core`] to an in-process cluster so experiments can run
//! end to end without a cloud account or a Kubernetes API:
//! - Layered settings (file, environment, command line)
//! - Instance stop and helper-worker faults
//! - A seeded simulator checking the core's invariants over many runs

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cluster;
pub mod faults;
pub mod launch;
pub mod settings;
pub mod simulator;

pub use cluster::{InstanceState, SimCluster, SimTargets};
pub use faults::InstanceStop;
pub use launch::{abort_after, prepare, Launch, LaunchOptions, Mode};
pub use settings::{Overrides, SettingsError};
pub use simulator::{run_simulator, simulate, SimulatorConfig, SimulatorReport, Violation};
