//! Ephemeral workers
//!
//! Short-lived execution units (helper pods, jobs) created on demand to
//! apply a fault from inside the cluster.

mod backend;
mod helper;
mod manager;

pub use backend::{generate_run_id, ResourceLimits, WorkerBackend, WorkerPhase, WorkerSpec};
pub use helper::{HelperFault, HelperTemplate};
pub use manager::{WorkerHandle, WorkerManager, WorkerOutcome, WorkerState, WorkerStats};
