use chaos_core::prelude::*;
use chaos_core::{
    CleanupPolicy, ErrorKind, HelperFailure, HelperFault, HelperTemplate, RetryPolicy,
    WorkerBackend, WorkerManager, WorkerSpec, WorkerState, WorkerStats,
};
use chaos_test_utils::{pods, FakeWorkerBackend, WorkerScript};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

fn ready_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_secs(1))
}

fn manager(backend: &Arc<FakeWorkerBackend>, policy: CleanupPolicy) -> WorkerManager {
    WorkerManager::new(backend.clone(), policy)
}

#[tokio::test(start_paused = true)]
async fn run_to_completion_cleans_up_after_success() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = manager(&backend, CleanupPolicy::Delete);

    let outcome = workers
        .run_to_completion(WorkerSpec::new("disk-fill"), ready_policy(), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(outcome.worker, backend.created()[0].name());
    assert_eq!(outcome.polls, 1);
    assert_eq!(outcome.elapsed, Duration::ZERO);
    assert_eq!(
        workers.stats(),
        WorkerStats {
            created: 1,
            cleaned: 1,
            active: 0
        }
    );
    assert_eq!(backend.deleted().len(), 1);
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn outcome_reports_how_long_the_worker_ran() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::Succeeds {
        pending: 0,
        running: 3,
    }));
    let workers = manager(&backend, CleanupPolicy::Delete);

    let handle = workers.create(WorkerSpec::new("pod-memory-hog")).await.unwrap();
    workers.await_ready(&handle, ready_policy()).await.unwrap();
    let outcome = workers
        .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(outcome.worker, handle.name);
    assert_eq!(outcome.polls, 3);
    assert_eq!(outcome.elapsed, Duration::from_secs(2));
    assert_eq!(handle.state(), WorkerState::Completed);
}

#[tokio::test(start_paused = true)]
async fn failed_worker_is_reported_with_its_reason() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::Fails {
        running: 2,
        reason: "OOMKilled".to_string(),
    }));
    let workers = manager(&backend, CleanupPolicy::Delete);

    let err = workers
        .run_to_completion(WorkerSpec::new("disk-fill"), ready_policy(), Duration::from_secs(10))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HelperFailed);
    match err {
        ChaosError::HelperFailed { cause, .. } => assert_eq!(
            cause,
            HelperFailure::Terminated {
                reason: "OOMKilled".to_string()
            }
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.live(), 0);
    assert_eq!(workers.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_overrunning_its_deadline_fails() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::NeverFinishes));
    let workers = manager(&backend, CleanupPolicy::Delete);

    let handle = workers.create(WorkerSpec::new("pod-delete")).await.unwrap();
    workers.await_ready(&handle, ready_policy()).await.unwrap();
    assert_eq!(handle.state(), WorkerState::Ready);

    let started = Instant::now();
    let err = workers
        .await_completion(&handle, Duration::from_secs(3), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert!(matches!(
        err,
        ChaosError::HelperFailed {
            cause: HelperFailure::DeadlineExceeded { .. },
            ..
        }
    ));
    assert_eq!(handle.state(), WorkerState::Failed);

    // await_completion leaves cleanup to the caller
    assert_eq!(workers.active_count(), 1);
    workers.cleanup(&handle).await.unwrap();
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_status_calls_do_not_stretch_the_deadline() {
    let backend = Arc::new(
        FakeWorkerBackend::new()
            .with_default(WorkerScript::NeverFinishes)
            .with_phase_delay(Duration::from_secs(10)),
    );
    let workers = manager(&backend, CleanupPolicy::Delete);
    let handle = workers.create(WorkerSpec::new("pod-dns-error")).await.unwrap();

    let started = Instant::now();
    let err = workers
        .await_completion(&handle, Duration::from_secs(5), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(matches!(
        err,
        ChaosError::HelperFailed {
            cause: HelperFailure::DeadlineExceeded { after },
            ..
        } if after == Duration::from_secs(5)
    ));
    workers.cleanup(&handle).await.unwrap();
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_is_an_abort_and_keeps_the_worker() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::NeverFinishes));
    let abort = AbortSignal::new();
    let workers = WorkerManager::new(backend.clone(), CleanupPolicy::Delete).cancel_on(abort.listener());
    let handle = workers.create(WorkerSpec::new("pod-delete")).await.unwrap();

    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.trigger();
    });

    let err = workers
        .await_completion(&handle, Duration::from_secs(60), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChaosError::Aborted));
    assert_eq!(workers.active_count(), 1);

    workers.cleanup_all().await.unwrap();
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_released_while_being_created_is_deleted() {
    let backend = Arc::new(FakeWorkerBackend::new().with_create_delay(Duration::from_secs(5)));
    let workers = Arc::new(manager(&backend, CleanupPolicy::Delete));

    let creating = tokio::spawn({
        let workers = Arc::clone(&workers);
        async move { workers.create(WorkerSpec::new("pod-cpu-hog")).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.live(), 1);
    assert_eq!(workers.active_count(), 1);

    workers.cleanup_all().await.unwrap();
    let err = creating.await.unwrap().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HelperUnavailable);
    assert_eq!(workers.active_count(), 0);
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_that_never_starts_is_removed() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::NeverReady));
    let workers = manager(&backend, CleanupPolicy::Delete);

    let handle = workers.create(WorkerSpec::new("pod-cpu-hog")).await.unwrap();
    let started = Instant::now();
    let err = workers
        .await_ready(&handle, RetryPolicy::new(3, Duration::from_secs(2)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HelperUnavailable);
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert_eq!(workers.active_count(), 0);
    assert_eq!(backend.deleted(), vec![handle.name.clone()]);
}

#[tokio::test(start_paused = true)]
async fn retain_policy_keeps_finished_workers() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = manager(&backend, CleanupPolicy::Retain);

    workers
        .run_to_completion(WorkerSpec::new("node-drain"), ready_policy(), Duration::from_secs(10))
        .await
        .unwrap();

    assert!(backend.deleted().is_empty());
    assert_eq!(backend.live(), 1);
    assert_eq!(workers.active_count(), 0);
    assert_eq!(workers.stats().cleaned, 1);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = manager(&backend, CleanupPolicy::Delete);

    let handle = workers.create(WorkerSpec::new("exp")).await.unwrap();
    workers.cleanup(&handle).await.unwrap();
    workers.cleanup(&handle).await.unwrap();

    assert_eq!(backend.deleted().len(), 1);
    assert_eq!(workers.stats().cleaned, 1);
}

#[tokio::test]
async fn worker_deleted_elsewhere_still_cleans_up() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = manager(&backend, CleanupPolicy::Delete);

    let handle = workers.create(WorkerSpec::new("exp")).await.unwrap();
    backend.delete_worker(&handle.name).await.unwrap();

    workers.cleanup(&handle).await.unwrap();
    assert_eq!(workers.active_count(), 0);
}

#[tokio::test]
async fn rejected_create_is_retryable_and_untracked() {
    let backend = Arc::new(FakeWorkerBackend::new().failing_create());
    let workers = manager(&backend, CleanupPolicy::Delete);

    let err = workers.create(WorkerSpec::new("exp")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(err.is_retryable());
    assert_eq!(workers.stats(), WorkerStats::default());
}

#[tokio::test]
async fn cleanup_all_releases_every_worker() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = manager(&backend, CleanupPolicy::Delete);
    for _ in 0..3 {
        workers.create(WorkerSpec::new("exp")).await.unwrap();
    }
    assert_eq!(workers.active_count(), 3);

    workers.cleanup_all().await.unwrap();
    assert_eq!(workers.active_count(), 0);
    assert_eq!(backend.deleted().len(), 3);
}

#[test]
fn worker_names_and_labels() {
    let mut extra = BTreeMap::new();
    extra.insert("app".to_string(), "hijack".to_string());
    extra.insert("team".to_string(), "sre".to_string());
    let spec = WorkerSpec::new("pod-network-loss").with_labels(&extra);

    assert_eq!(spec.run_id.len(), 6);
    assert!(spec
        .run_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert_eq!(spec.name(), format!("pod-network-loss-helper-{}", spec.run_id));
    assert_eq!(spec.labels.get("app"), Some(&spec.name()));
    assert_eq!(spec.labels.get("team").map(String::as_str), Some("sre"));
    assert_eq!(spec.app_label(), format!("app={}", spec.name()));

    // two workers of one experiment never collide
    assert_ne!(WorkerSpec::new("x").name(), WorkerSpec::new("x").name());
}

#[tokio::test(start_paused = true)]
async fn helper_fault_pins_workers_to_the_target_host() {
    let backend = Arc::new(FakeWorkerBackend::new());
    let workers = Arc::new(manager(&backend, CleanupPolicy::Delete));
    let fault = HelperFault::new(HelperTemplate::new("pod-io-stress"), Arc::clone(&workers), ready_policy())
        .host_scoped(true);

    let targets: Vec<Target> = pods(2)
        .into_iter()
        .map(|t| t.on_host("node-7"))
        .collect();

    fault.inject(&targets).await.unwrap();
    fault.confirm_started(&targets).await.unwrap();

    let created = backend.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].host.as_deref(), Some("node-7"));
    assert_eq!(created[0].targets.len(), 2);

    fault.revert(&targets).await.unwrap();
    fault.confirm_reverted(&targets).await.unwrap();
    assert_eq!(workers.active_count(), 0);
    assert_eq!(backend.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn helper_fault_emergency_revert_skips_waiting() {
    let backend = Arc::new(FakeWorkerBackend::new().with_default(WorkerScript::NeverFinishes));
    let workers = Arc::new(manager(&backend, CleanupPolicy::Delete));
    let fault = HelperFault::new(HelperTemplate::new("pod-cpu-hog"), Arc::clone(&workers), ready_policy());

    let targets = pods(1);
    fault.inject(&targets).await.unwrap();
    fault.confirm_started(&targets).await.unwrap();

    let started = Instant::now();
    fault.emergency_revert(&targets).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(backend.live(), 0);

    fault.cleanup().await.unwrap();
    assert_eq!(workers.active_count(), 0);
}
