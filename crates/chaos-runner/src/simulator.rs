//! Chaos Simulator - seeded invariant checking
//!
//! Runs many randomized experiments against the simulated cluster on a
//! paused clock and checks the invariants every run must keep:
//! - The number of selected targets matches the affected percentage
//! - A passed run leaves every target reverted
//! - No run leaves an instance stopped or a helper worker behind
//! - Instances that were never selected are never stopped
//!
//! The same seed always produces the same sequence of experiments.

use crate::launch::{abort_after, prepare, LaunchOptions, Mode};
use chaos_core::{
    selection_count, AbortSignal, ChaosInterval, ChaosResult, CleanupPolicy, ExperimentConfig,
    Sequence, TargetId, TargetStatus, Verdict,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Experiments to run
    pub runs: u64,
    /// Stop at the first violating run
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            runs: 100,
            stop_on_first_violation: false,
        }
    }
}

/// One generated experiment
#[derive(Debug, Clone)]
pub struct SimulatedRun {
    pub index: u64,
    pub config: ExperimentConfig,
    pub options: LaunchOptions,
    /// Seconds after start at which the run is aborted
    pub abort_after: Option<u64>,
}

/// A broken invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Violation {
    /// Selected target count does not match the percentage
    SelectionSize {
        run: u64,
        expected: usize,
        actual: usize,
    },
    /// A passed run left a target in a non-reverted status
    TargetNotReverted {
        run: u64,
        target: TargetId,
        status: TargetStatus,
    },
    /// A target is still tagged injected after the run
    TargetLeftInjected { run: u64, target: TargetId },
    /// Instance not running after the run
    InstanceNotRunning { run: u64, instance: String },
    /// An instance that was never selected got stopped
    UnselectedInstanceTouched { run: u64, instance: String },
    /// Helper workers still present after the run
    WorkersLeaked { run: u64, live: usize },
    /// Verdict other than the one the run must produce
    UnexpectedVerdict {
        run: u64,
        expected: Verdict,
        actual: Verdict,
        reason: Option<String>,
    },
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub runs: u64,
    pub passed: u64,
    pub failed: u64,
    pub stopped: u64,
    pub rounds: u64,
    pub targets_reverted: u64,
    pub helper_runs: u64,
}

/// Final simulator report
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// No invariant was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Chaos Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Runs: {}", self.stats.runs);
        let _ = writeln!(report, "  Passed: {}", self.stats.passed);
        let _ = writeln!(report, "  Failed: {}", self.stats.failed);
        let _ = writeln!(report, "  Stopped: {}", self.stats.stopped);
        let _ = writeln!(report, "  Helper runs: {}", self.stats.helper_runs);
        let _ = writeln!(report, "Rounds: {}", self.stats.rounds);
        let _ = writeln!(report, "Targets reverted: {}", self.stats.targets_reverted);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Run the simulator on its own paused-clock runtime
///
/// # Errors
/// Returns an error if the runtime cannot be built
pub fn simulate(config: SimulatorConfig) -> std::io::Result<SimulatorReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()?;
    Ok(runtime.block_on(run_simulator(config)))
}

/// Run the simulator on the current runtime
///
/// The runtime clock should be paused; otherwise every run takes its real
/// duration.
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    for index in 0..config.runs {
        let run = generate_run(&mut rng, index);
        let found = execute_run(&run, &mut stats).await;
        let stop = config.stop_on_first_violation && !found.is_empty();
        violations.extend(found);
        if stop {
            break;
        }
    }

    SimulatorReport {
        config,
        stats,
        violations,
    }
}

fn generate_run(rng: &mut StdRng, index: u64) -> SimulatedRun {
    let mode = if rng.gen_bool(0.5) { Mode::Instance } else { Mode::Helper };
    let duration = rng.gen_range(1..=20);
    let interval = if rng.gen_bool(0.7) {
        ChaosInterval::fixed(rng.gen_range(1..=5))
    } else {
        let lower = rng.gen_range(1..=3);
        ChaosInterval::Range {
            lower,
            upper: lower + rng.gen_range(0..=3),
        }
    };
    let sequence = match rng.gen_range(0..3) {
        0 => Sequence::Serial,
        1 => Sequence::Parallel,
        _ => Sequence::Random,
    }
    .resolve(rng);

    let config = ExperimentConfig::new()
        .with_name(format!("sim-{index}"))
        .with_duration(duration)
        .with_interval(interval)
        .with_ramp_time(rng.gen_range(0..=1))
        .with_sequence(sequence)
        .with_affected_percentage(rng.gen_range(0..=100))
        .with_checks(5, 1)
        .with_cleanup_policy(CleanupPolicy::Delete);

    let fail_ready = (mode == Mode::Helper && rng.gen_bool(0.2)).then(|| rng.gen_range(0..3));
    let abort_after = rng.gen_bool(0.25).then(|| rng.gen_range(0..=duration + 2));

    SimulatedRun {
        index,
        config,
        options: LaunchOptions {
            mode,
            targets: rng.gen_range(1..=8),
            nodes: rng.gen_range(1..=3),
            fail_ready,
            transition: Duration::from_secs(1),
            seed: Some(rng.gen()),
        },
        abort_after,
    }
}

async fn execute_run(run: &SimulatedRun, stats: &mut SimulatorStats) -> Vec<Violation> {
    let abort = AbortSignal::new();
    let launch = match prepare(run.config.clone(), &run.options, &abort) {
        Ok(launch) => launch,
        Err(e) => {
            tracing::error!(run = run.index, error = %e, "[Sim]: Could not prepare run");
            return Vec::new();
        }
    };

    let timer = run
        .abort_after
        .map(|secs| abort_after(&abort, Duration::from_secs(secs)));
    let result = launch.experiment.run(&abort).await;
    if let Some(timer) = timer {
        timer.abort();
    }

    stats.runs += 1;
    stats.rounds += u64::from(result.rounds);
    match result.verdict {
        Verdict::Passed => stats.passed += 1,
        Verdict::Failed => stats.failed += 1,
        Verdict::Stopped => stats.stopped += 1,
    }
    if run.options.mode == Mode::Helper {
        stats.helper_runs += 1;
    }
    stats.targets_reverted += result
        .targets
        .iter()
        .filter(|t| t.status == TargetStatus::Reverted)
        .count() as u64;

    let cluster = &launch.cluster;
    let mut violations = check_result(run, &result);

    violations.extend(
        cluster
            .instances_not_running()
            .into_iter()
            .map(|instance| Violation::InstanceNotRunning {
                run: run.index,
                instance,
            }),
    );

    let selected: HashSet<&str> = result.targets.iter().map(|t| t.id.as_str()).collect();
    violations.extend(
        cluster
            .instance_ids()
            .into_iter()
            .filter(|id| !selected.contains(id.as_str()) && cluster.stop_count(id) > 0)
            .map(|instance| Violation::UnselectedInstanceTouched {
                run: run.index,
                instance,
            }),
    );

    let live = cluster.live_workers();
    if live > 0 {
        violations.push(Violation::WorkersLeaked {
            run: run.index,
            live,
        });
    }

    for v in &violations {
        tracing::warn!(run = run.index, violation = ?v, "[Sim]: Invariant violated");
    }
    violations
}

fn check_result(run: &SimulatedRun, result: &ChaosResult) -> Vec<Violation> {
    let mut violations = Vec::new();

    // targets are registered once, at selection
    if !result.targets.is_empty() {
        let expected = selection_count(
            run.options.targets,
            i32::from(run.config.affected_percentage),
        );
        if result.targets.len() != expected {
            violations.push(Violation::SelectionSize {
                run: run.index,
                expected,
                actual: result.targets.len(),
            });
        }
    }

    for target in &result.targets {
        if target.status == TargetStatus::Injected {
            violations.push(Violation::TargetLeftInjected {
                run: run.index,
                target: target.id.clone(),
            });
        } else if result.verdict == Verdict::Passed && target.status != TargetStatus::Reverted {
            violations.push(Violation::TargetNotReverted {
                run: run.index,
                target: target.id.clone(),
                status: target.status,
            });
        }
    }

    if run.abort_after.is_none() && run.options.fail_ready.is_none() && result.verdict != Verdict::Passed {
        violations.push(Violation::UnexpectedVerdict {
            run: run.index,
            expected: Verdict::Passed,
            actual: result.verdict,
            reason: result.fail_step.clone(),
        });
    }

    violations
}
