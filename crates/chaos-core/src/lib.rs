//! Chaos Core - fault injection orchestrator
//!
//! The shared core behind every fault experiment:
//! - Percentage-based target selection
//! - Bounded retry/poll for state confirmation
//! - Ephemeral worker lifecycle (create, await ready, await completion, cleanup)
//! - Serial/parallel injection scheduling over a duration
//! - Concurrent abort handling with idempotent revert
//!
//! Each experiment supplies only a [`FaultStrategy`]; the loop, pacing,
//! abort path and bookkeeping live here.
//!
//! # Example
//!
//! ```rust,ignore
//! use chaos_core::prelude::*;
//!
//! # async fn example(strategy: Arc<dyn FaultStrategy>, source: Arc<dyn TargetSource>) {
//! let config = ExperimentConfig::new()
//!     .with_name("ec2-stop")
//!     .with_duration(60)
//!     .with_interval(ChaosInterval::fixed(20))
//!     .with_sequence(Sequence::Serial);
//!
//! let abort = AbortSignal::new();
//! let result = Experiment::new(config, strategy, source).run(&abort).await;
//! println!("verdict: {}", result.verdict);
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod abort;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod sink;
pub mod state_machine;
pub mod types;
pub mod worker;

pub use abort::{AbortListener, AbortReport, AbortSignal, AbortWatcher, FailedRevert};
pub use config::{ChaosInterval, CleanupPolicy, ExperimentConfig, RetryPolicy};
pub use context::RunContext;
pub use error::{
    CapabilityError, CapabilityErrorKind, ChaosError, ChaosResultOf, ErrorKind, HelperFailure,
    PollError,
};
pub use orchestrator::Experiment;
pub use probe::{NoProbes, ProbeRunner};
pub use registry::TargetRegistry;
pub use retry::{poll, Poll};
pub use scheduler::{FaultStrategy, InjectionScheduler, RunSummary, StaticTargets, TargetSource};
pub use selector::{selection_count, TargetSelector};
pub use sink::{ChaosEvent, ChaosResult, EventReason, EventSeverity, ResultSink, TracingSink};
pub use state_machine::{PhaseError, PhaseSnapshot, PhaseTracker, SchedulerPhase};
pub use types::{
    ExperimentPhase, ProbePhase, Sequence, Target, TargetId, TargetKind, TargetStatus, Verdict,
    WorkerId,
};
pub use worker::{
    HelperFault, HelperTemplate, ResourceLimits, WorkerBackend, WorkerHandle, WorkerManager,
    WorkerOutcome, WorkerPhase, WorkerSpec, WorkerState, WorkerStats,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for writing experiments
    pub use crate::{
        AbortSignal, ChaosError, ChaosInterval, ChaosResult, Experiment, ExperimentConfig,
        FaultStrategy, ProbeRunner, ResultSink, Sequence, Target, TargetId, TargetKind,
        TargetSource, Verdict,
    };
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
