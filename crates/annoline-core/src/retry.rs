//! Bounded retry with exponential backoff for per-record backend calls

use std::fmt::Display;
use std::time::{Duration, Instant};

/// Granularity of stop checks while sleeping between attempts.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// How an error should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Sleep with exponential backoff, then retry.
    Backoff,
    /// Retry right away.
    Immediate,
    /// Terminal for this item.
    Never,
}

/// Errors that know their own retry behaviour.
pub trait Retryable {
    fn retry_mode(&self) -> RetryMode;
}

/// Retry limits shared by every record in a run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Backoff unit; retry `n` sleeps `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Exponential backoff: `base * 2^attempt` (2s, 4s, 8s, ... for a 1s base)
pub fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Final state of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// Non-retryable error, or retries exhausted.
    Failed { error: E, attempts: u32 },
    /// A stop was requested between attempts.
    Interrupted { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Interrupted { attempts, .. } => *attempts,
        }
    }
}

/// Run `attempt_fn` until it succeeds, fails terminally, exhausts
/// `policy.max_retries`, or `should_stop` turns true between attempts.
///
/// `should_stop` is also polled while sleeping out a backoff, so a stop never
/// waits for the full delay. `attempt_fn` receives the 1-based attempt number.
pub fn retry_with_backoff<T, E: Retryable + Display>(
    label: &str,
    policy: &RetryPolicy,
    should_stop: impl Fn() -> bool,
    mut attempt_fn: impl FnMut(u32) -> Result<T, E>,
) -> RetryOutcome<T, E> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match attempt_fn(attempt) {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        let mode = error.retry_mode();
        if mode == RetryMode::Never || attempt > policy.max_retries {
            log::warn!("{label}: failed after {attempt} attempt(s): {error}");
            return RetryOutcome::Failed {
                error,
                attempts: attempt,
            };
        }

        log::debug!(
            "{label}: attempt {attempt}/{} failed: {error}, retrying...",
            policy.max_attempts()
        );
        if mode == RetryMode::Backoff
            && !sleep_unless(backoff_duration(policy.backoff_base, attempt), &should_stop)
        {
            return RetryOutcome::Interrupted {
                last_error: error,
                attempts: attempt,
            };
        }
        if should_stop() {
            return RetryOutcome::Interrupted {
                last_error: error,
                attempts: attempt,
            };
        }
    }
}

/// Sleep for `total`, waking early once `should_stop` is true. Returns `false` if stopped.
pub fn sleep_unless(total: Duration, should_stop: &impl Fn() -> bool) -> bool {
    let end = Instant::now() + total;
    loop {
        if should_stop() {
            return false;
        }
        let now = Instant::now();
        if now >= end {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(end - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::cancel::CancelFlag;

    #[derive(Debug)]
    struct TestErr(RetryMode);

    impl Display for TestErr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Retryable for TestErr {
        fn retry_mode(&self) -> RetryMode {
            self.0
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_exponential() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_duration(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_duration(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_duration(base, 3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_saturates() {
        let d = backoff_duration(Duration::from_secs(1), 200);
        assert!(d >= Duration::from_secs(1 << 31));
    }

    #[test]
    fn first_try_success() {
        let out = retry_with_backoff("t", &policy(3), || false, |_| {
            Ok::<_, TestErr>(7)
        });
        assert!(matches!(out, RetryOutcome::Succeeded { value: 7, attempts: 1 }));
    }

    #[test]
    fn always_transient_stops_at_max_retries_plus_one() {
        let mut calls = 0;
        let out = retry_with_backoff("t", &policy(2), || false, |_| {
            calls += 1;
            Err::<(), _>(TestErr(RetryMode::Backoff))
        });
        assert_eq!(calls, 3);
        assert!(matches!(out, RetryOutcome::Failed { attempts: 3, .. }));
    }

    #[test]
    fn immediate_mode_bounded_by_same_cap() {
        let mut calls = 0;
        let out = retry_with_backoff("t", &policy(1), || false, |_| {
            calls += 1;
            Err::<(), _>(TestErr(RetryMode::Immediate))
        });
        assert_eq!(calls, 2);
        assert_eq!(out.attempts(), 2);
    }

    #[test]
    fn never_mode_is_single_attempt() {
        let out = retry_with_backoff("t", &policy(5), || false, |_| {
            Err::<(), _>(TestErr(RetryMode::Never))
        });
        assert!(matches!(out, RetryOutcome::Failed { attempts: 1, .. }));
    }

    #[test]
    fn recovers_after_transient_errors() {
        let out = retry_with_backoff("t", &policy(3), || false, |attempt| {
            if attempt < 3 {
                Err(TestErr(RetryMode::Backoff))
            } else {
                Ok(attempt)
            }
        });
        assert!(matches!(out, RetryOutcome::Succeeded { value: 3, attempts: 3 }));
    }

    #[test]
    fn cancellation_interrupts_between_attempts() {
        let cancel = CancelFlag::new();
        let out = retry_with_backoff("t", &policy(5), || cancel.is_cancelled(), |_| {
            cancel.cancel();
            Err::<(), _>(TestErr(RetryMode::Immediate))
        });
        assert!(matches!(out, RetryOutcome::Interrupted { attempts: 1, .. }));
    }

    #[test]
    fn sleep_returns_false_when_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(!sleep_unless(Duration::from_secs(10), &|| cancel.is_cancelled()));
    }

    #[test]
    fn stop_raised_elsewhere_cuts_the_backoff_short() {
        let stop = AtomicBool::new(false);
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_secs(10),
        };
        let started = Instant::now();
        let mut calls = 0;
        let out = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::SeqCst);
            });
            retry_with_backoff("t", &policy, || stop.load(Ordering::SeqCst), |_| {
                calls += 1;
                Err::<(), _>(TestErr(RetryMode::Backoff))
            })
        });
        assert_eq!(calls, 1);
        assert!(matches!(out, RetryOutcome::Interrupted { attempts: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
