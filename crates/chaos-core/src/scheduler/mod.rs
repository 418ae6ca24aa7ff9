//! Injection scheduler
//!
//! Drives repeated injection rounds over the selected targets until the
//! chaos duration has elapsed. Elapsed time is only checked between rounds,
//! so a round that starts before the deadline always runs to completion.
//!
//! # Round shapes
//!
//! Serial: for each target, inject, confirm, (probe on the very first target
//! only), wait the interval, revert, confirm. Target `i + 1` is never touched
//! before target `i` is confirmed.
//!
//! Parallel: inject every batch, then confirm every batch, probe, wait the
//! interval, revert every batch, confirm every batch. Each step is a barrier.

mod strategy;

pub use strategy::{FaultStrategy, StaticTargets, TargetSource};

use crate::config::ExperimentConfig;
use crate::context::RunContext;
use crate::error::ChaosError;
use crate::probe::{NoProbes, ProbeRunner};
use crate::selector::TargetSelector;
use crate::sink::{ChaosEvent, EventReason};
use crate::state_machine::SchedulerPhase;
use crate::types::{ProbePhase, Sequence, Target};
use futures::future::join_all;
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// What a completed scheduler run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Rounds started
    pub rounds: u32,
    /// Sequence actually used
    pub sequence: Sequence,
    /// Wall time of the injection loop, ramps excluded
    pub chaos_elapsed: Duration,
}

/// Generic injection loop parameterised by a [`FaultStrategy`]
pub struct InjectionScheduler {
    config: ExperimentConfig,
    sequence: Sequence,
    strategy: Arc<dyn FaultStrategy>,
    source: Arc<dyn TargetSource>,
    probes: Arc<dyn ProbeRunner>,
    selector: TargetSelector,
    ctx: RunContext,
}

impl fmt::Debug for InjectionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionScheduler")
            .field("experiment", &self.config.experiment_name)
            .field("sequence", &self.sequence)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

impl InjectionScheduler {
    /// Create scheduler for one run
    ///
    /// A `Random` sequence is resolved here, once.
    pub fn new(
        config: ExperimentConfig,
        strategy: Arc<dyn FaultStrategy>,
        source: Arc<dyn TargetSource>,
        ctx: RunContext,
    ) -> Self {
        let sequence = config.sequence.resolve(&mut rand::thread_rng());
        Self {
            config,
            sequence,
            strategy,
            source,
            probes: Arc::new(NoProbes),
            selector: TargetSelector::for_run(),
            ctx,
        }
    }

    /// With probe runner for the during-chaos probes
    #[must_use]
    pub fn with_probes(mut self, probes: Arc<dyn ProbeRunner>) -> Self {
        self.probes = probes;
        self
    }

    /// With a fixed target selector
    #[must_use]
    pub fn with_selector(mut self, selector: TargetSelector) -> Self {
        self.selector = selector;
        self
    }

    /// With an already resolved sequence
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence.resolve(&mut rand::thread_rng());
        self
    }

    /// Sequence this scheduler will use
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Run the injection loop
    ///
    /// On failure, everything still injected or in flight is reverted on a
    /// best-effort basis and the strategy is cleaned up before the error is
    /// returned. Once an abort is latched the scheduler stops at its next
    /// phase change with `ChaosError::Aborted` and leaves reverting to the
    /// abort watcher.
    ///
    /// # Errors
    /// The first error of any round; no further target or round is attempted.
    pub async fn run(&self) -> Result<RunSummary, ChaosError> {
        match self.drive().await {
            Ok(summary) => Ok(summary),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn drive(&self) -> Result<RunSummary, ChaosError> {
        let phase = &self.ctx.phase;
        let duration = self.config.chaos_duration();

        phase.transition(SchedulerPhase::RampingUp)?;
        self.ramp("before").await?;

        let mut targets = self.select_targets().await?;

        tracing::info!(
            duration_secs = duration.as_secs(),
            interval = %self.config.chaos_interval,
            sequence = %self.sequence,
            "[Chaos]: Starting injection loop"
        );

        let started = Instant::now();
        let mut round = 0;
        while started.elapsed() < duration {
            round += 1;
            if round > 1 && self.strategy.resample_each_round() {
                targets = self.select_targets().await?;
            }

            phase.start_round(round)?;
            self.ctx
                .emit(ChaosEvent::new(
                    EventReason::ChaosInject,
                    format!(
                        "Injecting {} chaos on {} target(s), round {round}",
                        self.strategy.name(),
                        targets.len()
                    ),
                ))
                .await;

            match self.sequence {
                Sequence::Serial => self.serial_round(round, &targets).await?,
                Sequence::Parallel | Sequence::Random => self.parallel_round(&targets).await?,
            }
        }
        let chaos_elapsed = started.elapsed();

        phase.transition(SchedulerPhase::RampingDown)?;
        self.ramp("after").await?;
        phase.transition(SchedulerPhase::Done)?;

        tracing::info!(rounds = round, elapsed_secs = chaos_elapsed.as_secs(), "[Chaos]: Injection loop finished");
        Ok(RunSummary {
            rounds: round,
            sequence: self.sequence,
            chaos_elapsed,
        })
    }

    async fn ramp(&self, when: &str) -> Result<(), ChaosError> {
        let ramp = self.config.ramp_time();
        if ramp.is_zero() {
            return Ok(());
        }
        tracing::info!("[Ramp]: Waiting for the {}s ramp time {when} injecting chaos", ramp.as_secs());
        self.pause(ramp).await
    }

    /// Sleep for `period`, cut short by the abort signal
    async fn pause(&self, period: Duration) -> Result<(), ChaosError> {
        let mut listener = self.ctx.abort.listener();
        tokio::select! {
            biased;
            () = listener.wait() => Err(ChaosError::Aborted),
            () = sleep(period) => Ok(()),
        }
    }

    /// Once the abort latch is set, hand `targets` back to the abort path
    ///
    /// An injection that returns after the watcher took its snapshot may
    /// still have left a fault behind; the targets are marked in flight again
    /// so the final sweep reverts them. They are never marked injected.
    fn stop_if_aborting<'a>(&self, targets: impl IntoIterator<Item = &'a Target>) -> Result<(), ChaosError> {
        let registry = &self.ctx.registry;
        if !registry.is_aborting() {
            return Ok(());
        }
        for target in targets {
            registry.requeue_revert(&target.id);
        }
        Err(ChaosError::Aborted)
    }

    async fn select_targets(&self) -> Result<Vec<Target>, ChaosError> {
        let candidates = self.source.list_candidates().await?;
        let targets = self
            .selector
            .select(&candidates, i32::from(self.config.affected_percentage))?;
        self.ctx.registry.register(&targets);

        let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        tracing::info!(count = targets.len(), "[Info]: Target list: {}", ids.join(", "));
        Ok(targets)
    }

    async fn serial_round(&self, round: u32, targets: &[Target]) -> Result<(), ChaosError> {
        for (i, target) in targets.iter().enumerate() {
            let batch = slice::from_ref(target);

            self.inject_batch(batch)
                .await
                .map_err(|e| e.on_target(&target.id))?;

            if round == 1 && i == 0 {
                self.during_chaos_probes().await?;
            }

            self.wait_interval().await?;

            self.revert_batch(batch)
                .await
                .map_err(|e| e.on_target(&target.id))?;
        }
        Ok(())
    }

    async fn parallel_round(&self, targets: &[Target]) -> Result<(), ChaosError> {
        let batches = self.batches(targets);
        let registry = &self.ctx.registry;

        for target in targets {
            registry.begin_inject(&target.id)?;
        }

        tracing::info!(batches = batches.len(), "[Chaos]: Injecting all targets");
        let injected = join_all(batches.iter().map(|b| self.strategy.inject(b))).await;
        self.stop_if_aborting(targets)?;
        settle(injected, &batches, |_| {})?;

        let confirmed = join_all(batches.iter().map(|b| self.strategy.confirm_started(b))).await;
        self.stop_if_aborting(targets)?;
        settle(confirmed, &batches, |t| registry.mark_injected(&t.id))?;

        self.during_chaos_probes().await?;
        self.wait_interval().await?;

        tracing::info!(batches = batches.len(), "[Chaos]: Reverting all targets");
        let reverted = join_all(batches.iter().map(|b| self.strategy.revert(b))).await;
        settle(reverted, &batches, |_| {})?;

        let restored = join_all(batches.iter().map(|b| self.strategy.confirm_reverted(b))).await;
        settle(restored, &batches, |t| {
            registry.mark_reverted(&t.id);
        })
    }

    async fn inject_batch(&self, batch: &[Target]) -> Result<(), ChaosError> {
        let registry = &self.ctx.registry;
        for target in batch {
            registry.begin_inject(&target.id)?;
        }

        let injected = self.strategy.inject(batch).await;
        self.stop_if_aborting(batch)?;
        injected?;

        let confirmed = self.strategy.confirm_started(batch).await;
        self.stop_if_aborting(batch)?;
        confirmed?;

        for target in batch {
            registry.mark_injected(&target.id);
            tracing::info!(target_id = %target.id, "[Chaos]: Fault injected");
        }
        Ok(())
    }

    async fn revert_batch(&self, batch: &[Target]) -> Result<(), ChaosError> {
        self.strategy.revert(batch).await?;
        self.strategy.confirm_reverted(batch).await?;

        for target in batch {
            self.ctx.registry.mark_reverted(&target.id);
            tracing::info!(target_id = %target.id, "[Chaos]: Fault reverted");
        }
        Ok(())
    }

    async fn during_chaos_probes(&self) -> Result<(), ChaosError> {
        tracing::info!("[Probe]: Running during-chaos probes");
        self.probes.run_probes(ProbePhase::DuringChaos).await
    }

    async fn wait_interval(&self) -> Result<(), ChaosError> {
        self.ctx.phase.transition(SchedulerPhase::Waiting)?;
        let wait = self.config.chaos_interval.next_wait();
        tracing::info!("[Wait]: Waiting for the chaos interval of {}s", wait.as_secs());
        self.pause(wait).await?;
        self.ctx.phase.transition(SchedulerPhase::Injecting)?;
        Ok(())
    }

    /// One batch per target, or one per host for host-scoped strategies
    fn batches(&self, targets: &[Target]) -> Vec<Vec<Target>> {
        if !self.strategy.host_scoped() {
            return targets.iter().map(|t| vec![t.clone()]).collect();
        }

        let mut groups: Vec<Vec<Target>> = Vec::new();
        for target in targets {
            let same_host = target.host.as_ref().and_then(|host| {
                groups
                    .iter_mut()
                    .find(|g| g.first().and_then(|t| t.host.as_ref()) == Some(host))
            });
            match same_host {
                Some(group) => group.push(target.clone()),
                None => groups.push(vec![target.clone()]),
            }
        }
        groups
    }

    async fn fail(&self, err: ChaosError) -> ChaosError {
        if matches!(err.root(), ChaosError::Aborted) || self.ctx.phase.is_aborting() {
            return err;
        }

        tracing::error!(error = %err, "[Error]: Injection failed, reverting in-flight chaos");
        if let Err(e) = self.ctx.phase.transition(SchedulerPhase::Failed) {
            tracing::debug!(error = %e, "[Error]: Could not mark scheduler failed");
        }

        let registry = &self.ctx.registry;
        for target in registry.pending_revert() {
            match self.strategy.emergency_revert(slice::from_ref(&target)).await {
                Ok(()) => {
                    if !registry.mark_reverted(&target.id) {
                        registry.clear_in_flight(&target.id);
                    }
                }
                Err(e) => {
                    tracing::error!(target_id = %target.id, error = %e, "[Cleanup]: Failed to revert target");
                }
            }
        }

        if let Err(e) = self.strategy.cleanup().await {
            tracing::error!(error = %e, "[Cleanup]: Strategy cleanup failed");
        }
        err
    }
}

/// Apply `on_ok` to every target of each successful batch and return the
/// first failure, attributed to its batch
fn settle(
    results: Vec<Result<(), ChaosError>>,
    batches: &[Vec<Target>],
    on_ok: impl Fn(&Target),
) -> Result<(), ChaosError> {
    let mut first = None;
    for (result, batch) in results.into_iter().zip(batches) {
        match result {
            Ok(()) => batch.iter().for_each(&on_ok),
            Err(e) if first.is_none() => {
                first = Some(match batch.first() {
                    Some(target) => e.on_target(&target.id),
                    None => e,
                });
            }
            Err(e) => tracing::error!(error = %e, "[Error]: Additional batch failure"),
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetKind;
    use async_trait::async_trait;

    struct Noop {
        host_scoped: bool,
    }

    #[async_trait]
    impl FaultStrategy for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn host_scoped(&self) -> bool {
            self.host_scoped
        }
        async fn inject(&self, _: &[Target]) -> Result<(), ChaosError> {
            Ok(())
        }
        async fn confirm_started(&self, _: &[Target]) -> Result<(), ChaosError> {
            Ok(())
        }
        async fn revert(&self, _: &[Target]) -> Result<(), ChaosError> {
            Ok(())
        }
        async fn confirm_reverted(&self, _: &[Target]) -> Result<(), ChaosError> {
            Ok(())
        }
    }

    fn scheduler(host_scoped: bool) -> InjectionScheduler {
        InjectionScheduler::new(
            ExperimentConfig::default(),
            Arc::new(Noop { host_scoped }),
            Arc::new(StaticTargets(Vec::new())),
            RunContext::new("test", crate::abort::AbortSignal::new()),
        )
    }

    fn pods() -> Vec<Target> {
        vec![
            Target::new("a", TargetKind::Pod).on_host("node-1"),
            Target::new("b", TargetKind::Pod).on_host("node-2"),
            Target::new("c", TargetKind::Pod).on_host("node-1"),
            Target::new("d", TargetKind::Pod),
        ]
    }

    #[test]
    fn batches_one_per_target_by_default() {
        let batches = scheduler(false).batches(&pods());
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn host_scoped_batches_group_by_host() {
        let batches = scheduler(true).batches(&pods());
        let ids: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|t| t.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"], vec!["d"]]);
    }

    #[test]
    fn settle_attributes_first_failure() {
        let batches = vec![
            vec![Target::new("a", TargetKind::Pod)],
            vec![Target::new("b", TargetKind::Pod)],
        ];
        let marked = std::sync::Mutex::new(Vec::new());
        let err = settle(
            vec![Ok(()), Err(ChaosError::selection("boom"))],
            &batches,
            |t| marked.lock().unwrap().push(t.id.clone()),
        )
        .unwrap_err();

        assert_eq!(err.target().map(|t| t.as_str()), Some("b"));
        assert_eq!(marked.into_inner().unwrap(), vec![crate::types::TargetId::from("a")]);
    }

    #[test]
    fn fixed_sequence_is_kept() {
        let s = scheduler(false).with_sequence(Sequence::Serial);
        assert_eq!(s.sequence(), Sequence::Serial);
    }
}
