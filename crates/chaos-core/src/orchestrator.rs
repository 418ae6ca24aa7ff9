//! Experiment entrypoint
//!
//! Ties one run together:
//! - Pre-chaos probes
//! - Sequence resolution and target selection
//! - The injection loop, raced against the abort watcher
//! - Post-chaos probes
//! - The final verdict, reported to the result sink
//!
//! # Example
//!
//! ```rust,ignore
//! let experiment = Experiment::new(config, strategy, source).with_probes(probes);
//! let abort = AbortSignal::new();
//! let result = experiment.run(&abort).await;
//! std::process::exit(result.exit_code());
//! ```

use crate::abort::{AbortReport, AbortSignal, AbortWatcher};
use crate::config::ExperimentConfig;
use crate::context::RunContext;
use crate::error::ChaosError;
use crate::probe::{NoProbes, ProbeRunner};
use crate::scheduler::{FaultStrategy, InjectionScheduler, RunSummary, TargetSource};
use crate::selector::TargetSelector;
use crate::sink::{ChaosEvent, ChaosResult, EventReason, ResultSink, TracingSink};
use crate::types::{ExperimentPhase, ProbePhase, Sequence, Verdict};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinError;

/// How a run ended, before it is turned into a [`ChaosResult`]
enum Outcome {
    Passed(RunSummary),
    Failed(ChaosError),
    Stopped(AbortReport),
}

enum Race {
    Aborted(Result<AbortReport, JoinError>),
    Finished(Result<RunSummary, ChaosError>),
}

/// One configured chaos experiment
pub struct Experiment {
    config: ExperimentConfig,
    strategy: Arc<dyn FaultStrategy>,
    source: Arc<dyn TargetSource>,
    probes: Arc<dyn ProbeRunner>,
    sink: Arc<dyn ResultSink>,
    selector: TargetSelector,
    sequence: Option<Sequence>,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Create experiment with no probes, logging to the tracing sink
    pub fn new(
        config: ExperimentConfig,
        strategy: Arc<dyn FaultStrategy>,
        source: Arc<dyn TargetSource>,
    ) -> Self {
        Self {
            config,
            strategy,
            source,
            probes: Arc::new(NoProbes),
            sink: Arc::new(TracingSink),
            selector: TargetSelector::for_run(),
            sequence: None,
        }
    }

    /// With probe runner
    #[must_use]
    pub fn with_probes(mut self, probes: Arc<dyn ProbeRunner>) -> Self {
        self.probes = probes;
        self
    }

    /// With result sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// With a fixed target selector
    #[must_use]
    pub fn with_selector(mut self, selector: TargetSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Force the sequence instead of the configured one
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run the experiment to a verdict
    ///
    /// Never exits the process; map [`ChaosResult::exit_code`] at the edge.
    pub async fn run(&self, abort: &AbortSignal) -> ChaosResult {
        let started_at = Utc::now();
        let name = self.config.experiment_name.clone();
        let ctx = RunContext::new(name.clone(), abort.clone()).with_sink(Arc::clone(&self.sink));

        if let Err(e) = self.config.validate() {
            tracing::error!(experiment = %name, error = %e, "[Error]: Invalid experiment configuration");
            return self.finish(&ctx, Outcome::Failed(e), started_at).await;
        }

        let sequence = self
            .sequence
            .unwrap_or(self.config.sequence)
            .resolve(&mut rand::thread_rng());
        tracing::info!(experiment = %name, %sequence, "[Info]: Starting experiment");

        let watcher = Arc::new(AbortWatcher::new(
            Arc::clone(&ctx.registry),
            Arc::clone(&self.strategy),
            Arc::clone(&ctx.phase),
        ));
        let mut watch_task = watcher.spawn(abort.listener());

        let execute = self.execute(&ctx, sequence);
        tokio::pin!(execute);

        let race = tokio::select! {
            biased;
            report = &mut watch_task => Race::Aborted(report),
            result = &mut execute => Race::Finished(result),
        };

        let outcome = match race {
            Race::Aborted(report) => {
                // the scheduler stops at its next phase boundary; dropping it
                // here would lose whatever it was creating
                if let Err(e) = execute.await {
                    tracing::debug!(error = %e, "[Abort]: Injection loop stopped");
                }
                Outcome::Stopped(joined(report))
            }
            Race::Finished(_) if abort.is_triggered() => Outcome::Stopped(joined(watch_task.await)),
            Race::Finished(result) => {
                watch_task.abort();
                match result {
                    Ok(summary) => Outcome::Passed(summary),
                    Err(e) => Outcome::Failed(e),
                }
            }
        };

        let outcome = match outcome {
            Outcome::Stopped(report) => Outcome::Stopped(self.settle_abort(&watcher, report).await),
            other => other,
        };

        self.finish(&ctx, outcome, started_at).await
    }

    /// Revert what the scheduler left behind after the watcher ran, then
    /// release the strategy's resources once more
    async fn settle_abort(&self, watcher: &AbortWatcher, mut report: AbortReport) -> AbortReport {
        report.merge(watcher.sweep().await);
        if let Err(e) = self.strategy.cleanup().await {
            tracing::error!(error = %e, "[Abort]: Final cleanup failed");
            report.cleanup_error.get_or_insert_with(|| e.to_string());
        }
        report
    }

    async fn execute(&self, ctx: &RunContext, sequence: Sequence) -> Result<RunSummary, ChaosError> {
        ctx.report_phase(ExperimentPhase::PreChaos).await;
        tracing::info!("[Probe]: Running pre-chaos probes");
        self.probes.run_probes(ProbePhase::PreChaos).await?;
        if ctx.abort.is_triggered() {
            return Err(ChaosError::Aborted);
        }

        ctx.report_phase(ExperimentPhase::ChaosInjection).await;
        let scheduler = InjectionScheduler::new(
            self.config.clone(),
            Arc::clone(&self.strategy),
            Arc::clone(&self.source),
            ctx.clone(),
        )
        .with_probes(Arc::clone(&self.probes))
        .with_selector(self.selector)
        .with_sequence(sequence);
        let summary = scheduler.run().await?;

        ctx.report_phase(ExperimentPhase::PostChaos).await;
        tracing::info!("[Probe]: Running post-chaos probes");
        self.probes.run_probes(ProbePhase::PostChaos).await?;

        Ok(summary)
    }

    async fn finish(&self, ctx: &RunContext, outcome: Outcome, started_at: DateTime<Utc>) -> ChaosResult {
        let name = &self.config.experiment_name;
        let mut result = ChaosResult {
            experiment: name.clone(),
            verdict: Verdict::Passed,
            phase: ExperimentPhase::Completed,
            fail_step: None,
            error_code: None,
            failed_target: None,
            targets: ctx.registry.snapshot(),
            rounds: ctx.phase.snapshot().round,
            abort: None,
            started_at,
            finished_at: Utc::now(),
        };

        let summary = match outcome {
            Outcome::Passed(summary) => {
                format!("{name} experiment has been Passed after {} round(s)", summary.rounds)
            }
            Outcome::Failed(e) => {
                tracing::error!(experiment = %name, error = %e, "[Error]: Experiment failed");
                result.verdict = Verdict::Failed;
                result.fail_step = Some(e.to_string());
                result.error_code = Some(e.kind().code().to_string());
                result.failed_target = e.target().cloned();
                format!("{name} experiment has been Failed: {e}")
            }
            Outcome::Stopped(report) => {
                ctx.emit(
                    ChaosEvent::new(
                        EventReason::Abort,
                        format!(
                            "Experiment aborted, {} target(s) reverted, {} revert(s) failed",
                            report.reverted.len(),
                            report.failed.len()
                        ),
                    )
                    .warning(),
                )
                .await;
                result.verdict = Verdict::Stopped;
                result.phase = ExperimentPhase::Aborted;
                result.fail_step = Some("experiment aborted".to_string());
                result.error_code = Some(ChaosError::Aborted.kind().code().to_string());
                result.abort = Some(report);
                format!("{name} experiment has been Stopped")
            }
        };

        let event = ChaosEvent::new(EventReason::Summary, summary);
        let event = if result.verdict == Verdict::Passed {
            event
        } else {
            event.warning()
        };
        ctx.emit(event).await;

        if let Err(e) = self.sink.record_result(&result).await {
            tracing::warn!(error = %e, "[Warning]: Failed to record the chaos result");
        }
        ctx.report_phase(result.phase).await;
        result
    }
}

fn joined(report: Result<AbortReport, JoinError>) -> AbortReport {
    report.unwrap_or_else(|e| {
        tracing::error!(error = %e, "[Abort]: Abort watcher did not finish");
        AbortReport {
            cleanup_error: Some(format!("abort watcher did not finish: {e}")),
            ..AbortReport::default()
        }
    })
}
