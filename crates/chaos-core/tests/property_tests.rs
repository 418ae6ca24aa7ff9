use chaos_core::state_machine::{allowed_transitions, validate_transition};
use chaos_core::{poll, selection_count, SchedulerPhase, TargetSelector};
use chaos_test_utils::pods;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn phase() -> impl Strategy<Value = SchedulerPhase> {
    prop_oneof![
        Just(SchedulerPhase::Idle),
        Just(SchedulerPhase::RampingUp),
        Just(SchedulerPhase::Injecting),
        Just(SchedulerPhase::Waiting),
        Just(SchedulerPhase::RampingDown),
        Just(SchedulerPhase::Done),
        Just(SchedulerPhase::Aborting),
        Just(SchedulerPhase::Failed),
    ]
}

#[test]
fn aborting_accepts_nothing() {
    assert!(validate_transition(SchedulerPhase::Aborting, SchedulerPhase::Done).is_err());
    assert!(validate_transition(SchedulerPhase::Aborting, SchedulerPhase::Injecting).is_err());
    assert!(allowed_transitions(SchedulerPhase::Aborting).is_empty());
}

#[test]
fn waiting_returns_to_injecting() {
    assert!(validate_transition(SchedulerPhase::Injecting, SchedulerPhase::Waiting).is_ok());
    assert!(validate_transition(SchedulerPhase::Waiting, SchedulerPhase::Injecting).is_ok());
    assert!(validate_transition(SchedulerPhase::Waiting, SchedulerPhase::Done).is_err());
}

proptest! {
    #[test]
    fn prop_transitions_match_allowed_set(from in phase(), to in phase()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_every_live_phase_can_abort(from in phase()) {
        if !from.is_terminal() && from != SchedulerPhase::Aborting {
            prop_assert!(validate_transition(from, SchedulerPhase::Aborting).is_ok());
        }
    }

    #[test]
    fn prop_selection_size_and_uniqueness(n in 1usize..60, percent in -10i32..150, seed in any::<u64>()) {
        let candidates = pods(n);
        let selector = TargetSelector::new(seed);
        let selected = selector.select(&candidates, percent).unwrap();

        let p = usize::try_from(percent.clamp(0, 100)).unwrap();
        let expected = ((n * p).div_ceil(100)).max(1);
        prop_assert_eq!(selected.len(), expected);
        prop_assert_eq!(selection_count(n, percent), expected);

        let unique: HashSet<_> = selected.iter().map(|t| t.id.clone()).collect();
        prop_assert_eq!(unique.len(), selected.len());

        // same seed, same targets
        prop_assert_eq!(selector.select(&candidates, percent).unwrap(), selected);
    }

    #[test]
    fn prop_selection_ignores_duplicates(n in 1usize..20, copies in 1usize..4) {
        let mut candidates = Vec::new();
        for _ in 0..copies {
            candidates.extend(pods(n));
        }
        let selected = TargetSelector::new(7).select(&candidates, 100).unwrap();
        prop_assert_eq!(selected.len(), n);
    }

    #[test]
    fn prop_poll_is_bounded(attempts in 1u32..12, delay_ms in 1u64..2_000, succeed_at in 0u32..20) {
        let rt = paused_runtime();
        let calls = AtomicU32::new(0);
        let delay = Duration::from_millis(delay_ms);

        let (result, elapsed) = rt.block_on(async {
            let started = Instant::now();
            let result = poll(attempts, delay, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt >= succeed_at {
                        Ok(())
                    } else {
                        Err(format!("attempt {attempt} not ready"))
                    }
                }
            })
            .await;
            (result, started.elapsed())
        });

        let made = calls.load(Ordering::SeqCst);
        prop_assert!(made <= attempts);
        prop_assert!(elapsed <= delay * (attempts - 1));

        if succeed_at < attempts {
            prop_assert!(result.is_ok());
            prop_assert_eq!(made, succeed_at + 1);
            prop_assert_eq!(elapsed, delay * succeed_at);
        } else {
            prop_assert!(result.unwrap_err().is_exhausted());
            prop_assert_eq!(made, attempts);
        }
    }
}
