use chaos_core::prelude::*;
use chaos_core::{
    CleanupPolicy, ExperimentPhase, HelperFault, HelperTemplate, ProbePhase, StaticTargets, TargetSelector,
    TargetStatus, WorkerManager,
};
use chaos_test_utils::{
    fast_config, instances, pods, FakeStrategy, FakeWorkerBackend, MemorySink, Op, ScriptedProbes,
    WorkerScript,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn experiment(
    config: ExperimentConfig,
    strategy: Arc<dyn FaultStrategy>,
    targets: Vec<Target>,
) -> Experiment {
    Experiment::new(config, strategy, Arc::new(StaticTargets(targets)))
        .with_selector(TargetSelector::new(0))
}

fn status_of(result: &ChaosResult, id: &str) -> Option<TargetStatus> {
    result
        .targets
        .iter()
        .find(|t| t.id.as_str() == id)
        .map(|t| t.status)
}

#[tokio::test(start_paused = true)]
async fn scenario_a_serial_two_targets() {
    let strategy = Arc::new(FakeStrategy::new());
    let probes = ScriptedProbes::new();
    let config = fast_config(5, 1).with_sequence(Sequence::Serial);

    let started = Instant::now();
    let result = experiment(config, strategy.clone(), pods(2))
        .with_probes(probes.clone())
        .run(&AbortSignal::new())
        .await;

    assert_eq!(result.verdict, Verdict::Passed);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(result.rounds >= 1);

    let first_round: Vec<(Op, String)> = strategy
        .calls()
        .into_iter()
        .take(8)
        .map(|c| (c.op, c.targets[0].to_string()))
        .collect();
    assert_eq!(
        first_round,
        vec![
            (Op::Inject, "pod-0".to_string()),
            (Op::ConfirmStarted, "pod-0".to_string()),
            (Op::Revert, "pod-0".to_string()),
            (Op::ConfirmReverted, "pod-0".to_string()),
            (Op::Inject, "pod-1".to_string()),
            (Op::ConfirmStarted, "pod-1".to_string()),
            (Op::Revert, "pod-1".to_string()),
            (Op::ConfirmReverted, "pod-1".to_string()),
        ]
    );

    assert_eq!(probes.count(ProbePhase::DuringChaos), 1);
    assert_eq!(probes.count(ProbePhase::PreChaos), 1);
    assert_eq!(probes.count(ProbePhase::PostChaos), 1);
    assert_eq!(status_of(&result, "pod-0"), Some(TargetStatus::Reverted));
    assert_eq!(status_of(&result, "pod-1"), Some(TargetStatus::Reverted));
    assert!(strategy.faulted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_parallel_helper_never_ready() {
    let backend = Arc::new(
        FakeWorkerBackend::new().with_script(1, WorkerScript::NeverReady),
    );
    let manager = Arc::new(WorkerManager::new(backend.clone(), CleanupPolicy::Delete));
    let config = fast_config(30, 5).with_sequence(Sequence::Parallel);
    let strategy = Arc::new(HelperFault::new(
        HelperTemplate::new("pod-cpu-hog"),
        Arc::clone(&manager),
        config.retry_policy().unwrap(),
    ));

    let result = experiment(config, strategy, pods(3))
        .run(&AbortSignal::new())
        .await;

    assert_eq!(result.verdict, Verdict::Failed);
    assert_eq!(result.error_code.as_deref(), Some("HELPER_UNAVAILABLE"));
    assert_eq!(result.failed_target.as_ref().map(TargetId::as_str), Some("pod-1"));
    assert!(result.fail_step.is_some());

    assert_eq!(backend.created().len(), 3);
    assert_eq!(backend.deleted().len(), 3);
    assert_eq!(backend.live(), 0);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_abort_mid_round() {
    let strategy = Arc::new(FakeStrategy::new());
    let sink = MemorySink::new();
    let config = fast_config(60, 10).with_sequence(Sequence::Serial);

    let abort = AbortSignal::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(15)).await;
        trigger.trigger();
    });

    let result = experiment(config, strategy.clone(), pods(3))
        .with_sink(sink.clone())
        .run(&abort)
        .await;

    assert_eq!(result.verdict, Verdict::Stopped);
    assert_eq!(result.exit_code(), 2);
    assert_eq!(result.phase, ExperimentPhase::Aborted);

    let report = result.abort.clone().unwrap();
    assert_eq!(report.reverted, vec![TargetId::from("pod-1")]);
    assert!(report.is_clean());

    // pod-0 was reverted by the scheduler, pod-1 by the abort path, once each
    assert_eq!(strategy.effective_reverts("pod-0"), 1);
    assert_eq!(strategy.effective_reverts("pod-1"), 1);
    assert_eq!(strategy.calls_of(Op::EmergencyRevert).len(), 1);
    assert!(strategy.ops_for("pod-2").is_empty());
    assert!(strategy.faulted().is_empty());

    assert_eq!(status_of(&result, "pod-0"), Some(TargetStatus::Reverted));
    assert_eq!(status_of(&result, "pod-1"), Some(TargetStatus::Reverted));
    assert_eq!(status_of(&result, "pod-2"), Some(TargetStatus::NotInjected));

    assert_eq!(sink.phases().last(), Some(&ExperimentPhase::Aborted));
    assert!(sink
        .events()
        .iter()
        .any(|e| e.reason == chaos_core::EventReason::Abort));
    assert_eq!(sink.results().len(), 1);
}

#[test]
fn scenario_d_zero_percent_selects_one() {
    let selected = TargetSelector::new(42).select(&instances(10), 0).unwrap();
    assert_eq!(selected.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_soft_duration() {
    let strategy = Arc::new(FakeStrategy::new().with_inject_delay(Duration::from_secs(1)));
    let config = fast_config(10, 3).with_sequence(Sequence::Serial);

    let started = Instant::now();
    let result = experiment(config, strategy.clone(), pods(1))
        .run(&AbortSignal::new())
        .await;

    assert_eq!(result.verdict, Verdict::Passed);
    assert_eq!(result.rounds, 3);
    assert_eq!(started.elapsed(), Duration::from_secs(12));

    let inject_times: Vec<Duration> = strategy
        .calls_of(Op::Inject)
        .into_iter()
        .map(|c| c.at)
        .collect();
    assert_eq!(
        inject_times,
        vec![
            Duration::from_secs(0),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );
}
