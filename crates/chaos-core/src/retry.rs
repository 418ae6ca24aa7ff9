//! Bounded retry / poll primitive
//!
//! Every externally observed state transition (attached/detached,
//! running/stopped, worker ready) is confirmed by polling a check up to N
//! times with a fixed delay between attempts.
//!
//! # Example
//!
//! ```rust,ignore
//! Poll::from_policy(config.retry_policy()?)
//!     .cancel_on(abort.listener())
//!     .until(|attempt| async move { cloud.volume_state(&id).await?.expect(Attached) })
//!     .await
//!     .map_err(|e| e.into_state_check("volume attached"))?;
//! ```

use crate::abort::AbortListener;
use crate::config::RetryPolicy;
use crate::error::PollError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// Call `check` up to `attempts` times, `delay` apart, until it succeeds
///
/// Shorthand for `Poll::times(attempts).wait(delay).until(check)`.
///
/// # Errors
/// Returns `PollError::Exhausted` with the last check error once attempts run out
pub async fn poll<F, Fut, E>(attempts: u32, delay: Duration, check: F) -> Result<(), PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    Poll::times(attempts).wait(delay).until(check).await
}

/// Poll builder
#[derive(Debug, Clone)]
#[must_use = "a Poll does nothing until `until` is awaited"]
pub struct Poll {
    attempts: u32,
    delay: Duration,
    attempt_timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: Option<AbortListener>,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

enum Failure<E> {
    Check(E),
    TimedOut(u32),
}

impl Poll {
    /// Poll up to `attempts` times (at least once)
    pub fn times(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: Duration::ZERO,
            attempt_timeout: None,
            deadline: None,
            cancel: None,
        }
    }

    /// Poll with a derived `(attempts, delay)` policy
    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::times(policy.attempts).wait(policy.delay)
    }

    /// Delay between attempts
    pub fn wait(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Upper bound for a single attempt
    pub fn attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Stop early once `deadline` passes
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop early once the abort signal fires
    pub fn cancel_on(mut self, listener: AbortListener) -> Self {
        self.cancel = Some(listener);
        self
    }

    /// Run the check until it succeeds or the policy gives up
    ///
    /// `check` receives the zero-based attempt number. No sleep happens
    /// before the first attempt or after the last one.
    ///
    /// # Errors
    /// - `PollError::Exhausted` with the last check error
    /// - `PollError::AttemptTimedOut` when the last attempt overran its timeout
    /// - `PollError::Cancelled` / `PollError::DeadlineElapsed` when stopped early
    pub async fn until<F, Fut, E>(self, mut check: F) -> Result<(), PollError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let Self {
            attempts,
            delay,
            attempt_timeout,
            deadline,
            mut cancel,
        } = self;

        let mut last = None;
        for attempt in 0..attempts {
            if cancel.as_ref().is_some_and(AbortListener::is_triggered) {
                return Err(PollError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(PollError::DeadlineElapsed);
            }

            let run = async {
                match attempt_timeout {
                    Some(limit) => match timeout(limit, check(attempt)).await {
                        Ok(result) => result.map_err(Failure::Check),
                        Err(_) => Err(Failure::TimedOut(attempt)),
                    },
                    None => check(attempt).await.map_err(Failure::Check),
                }
            };

            match interruptible(run, cancel.as_mut(), deadline).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(failure)) => last = Some(failure),
                Err(Interrupt::Cancelled) => return Err(PollError::Cancelled),
                Err(Interrupt::Deadline) => return Err(PollError::DeadlineElapsed),
            }

            if attempt + 1 < attempts && !delay.is_zero() {
                match interruptible(sleep(delay), cancel.as_mut(), deadline).await {
                    Ok(()) => {}
                    Err(Interrupt::Cancelled) => return Err(PollError::Cancelled),
                    Err(Interrupt::Deadline) => return Err(PollError::DeadlineElapsed),
                }
            }
        }

        match last {
            Some(Failure::Check(last)) => Err(PollError::Exhausted { attempts, last }),
            Some(Failure::TimedOut(attempt)) => Err(PollError::AttemptTimedOut {
                attempt: attempt + 1,
                timeout: attempt_timeout.unwrap_or_default(),
            }),
            // attempts is at least one, so the loop always records an outcome
            None => Err(PollError::DeadlineElapsed),
        }
    }
}

async fn interruptible<T>(
    fut: impl Future<Output = T>,
    cancel: Option<&mut AbortListener>,
    deadline: Option<Instant>,
) -> Result<T, Interrupt> {
    let cancelled = async {
        match cancel {
            Some(listener) => listener.wait().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        () = cancelled => Err(Interrupt::Cancelled),
        () = expired => Err(Interrupt::Deadline),
        value = fut => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortSignal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let result: Result<(), PollError<String>> = poll(5, Duration::from_secs(2), |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("not ready on attempt {attempt}"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_without_trailing_sleep() {
        let started = Instant::now();
        let result = poll(3, Duration::from_secs(1), |attempt| async move {
            Err::<(), _>(format!("attempt {attempt}"))
        })
        .await;

        assert_eq!(
            result,
            Err(PollError::Exhausted {
                attempts: 3,
                last: "attempt 2".to_string()
            })
        );
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_distinct_from_exhaustion() {
        let signal = AbortSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            trigger.trigger();
        });

        let result = Poll::times(100)
            .wait(Duration::from_secs(1))
            .cancel_on(signal.listener())
            .until(|_| async { Err::<(), _>("still detaching") })
            .await;

        assert!(result.as_ref().unwrap_err().is_cancelled());
        assert!(!result.unwrap_err().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_polling() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = Poll::times(100)
            .wait(Duration::from_secs(2))
            .deadline(deadline)
            .until(|_| async { Err::<(), _>("pending") })
            .await;

        assert_eq!(result, Err(PollError::DeadlineElapsed));
        assert!(Instant::now() <= deadline + Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn per_attempt_timeout() {
        let result = Poll::times(2)
            .attempt_timeout(Duration::from_secs(1))
            .until(|_| async {
                sleep(Duration::from_secs(10)).await;
                Ok::<(), String>(())
            })
            .await;

        assert!(matches!(result, Err(PollError::AttemptTimedOut { attempt: 2, .. })));
    }

    #[tokio::test]
    async fn zero_attempts_still_checks_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), PollError<()>> = poll(0, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
