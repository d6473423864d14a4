//! Bounded Retry Policies
//!
//! Named, fixed delay schedules for the two known eventual-consistency
//! cases: self-healing a suspected failed seed, and polling for a freshly
//! created template to become visible. Each attempt waits for its delay
//! first, so `delays.len()` is the attempt count. There is no unbounded mode.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A fixed retry schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub name: String,
    pub delays: Vec<Duration>,
}

/// What an attempt decided
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Transient failure; try again if the schedule allows
    Retry(E),
    /// Permanent failure; stop now
    Abort(E),
}

/// Terminal result of running a policy
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Done { value: T, attempts: usize },
    Exhausted { attempts: usize, last_error: Option<E> },
    Aborted { attempts: usize, error: E },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Done { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, delays: Vec<Duration>) -> Self {
        Self {
            name: name.into(),
            delays,
        }
    }

    pub fn from_millis(name: impl Into<String>, delays_ms: &[u64]) -> Self {
        Self::new(
            name,
            delays_ms.iter().copied().map(Duration::from_millis).collect(),
        )
    }

    /// Short/medium/long schedule used to re-run seeding
    pub fn self_heal() -> Self {
        Self::from_millis("self_heal_seed", &[250, 1_000, 3_000])
    }

    /// Schedule used to wait for a created template to become readable
    pub fn template_visibility() -> Self {
        Self::from_millis("template_visibility", &[100, 400, 1_200])
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    /// Run `op` under this schedule. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RetryOutcome<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut last_error = None;

        for (index, delay) in self.delays.iter().enumerate() {
            let attempt = index + 1;
            tokio::time::sleep(*delay).await;

            match op(attempt).await {
                Attempt::Done(value) => {
                    debug!(policy = %self.name, attempt, "Retry policy succeeded");
                    return RetryOutcome::Done {
                        value,
                        attempts: attempt,
                    };
                }
                Attempt::Retry(error) => {
                    warn!(
                        policy = %self.name,
                        attempt,
                        max_attempts = self.max_attempts(),
                        error = %error,
                        "Attempt failed, will retry"
                    );
                    last_error = Some(error);
                }
                Attempt::Abort(error) => {
                    warn!(policy = %self.name, attempt, error = %error, "Attempt aborted");
                    return RetryOutcome::Aborted {
                        attempts: attempt,
                        error,
                    };
                }
            }
        }

        warn!(
            policy = %self.name,
            attempts = self.max_attempts(),
            "Retry schedule exhausted"
        );
        RetryOutcome::Exhausted {
            attempts: self.max_attempts(),
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let outcome: RetryOutcome<&str, String> = RetryPolicy::self_heal()
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Attempt::Retry("not yet".to_string())
                    } else {
                        Attempt::Done("ok")
                    }
                }
            })
            .await;

        assert!(outcome.is_done());
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_fixed_attempts() {
        let calls = AtomicUsize::new(0);
        let outcome: RetryOutcome<(), String> = RetryPolicy::self_heal()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Attempt::Retry(format!("failure {}", attempt)) }
            })
            .await;

        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.as_deref(), Some("failure 3"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let outcome: RetryOutcome<(), String> = RetryPolicy::template_visibility()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Abort("not found".to_string()) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Aborted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_full_schedule() {
        let start = tokio::time::Instant::now();
        let _: RetryOutcome<(), String> = RetryPolicy::from_millis("t", &[10, 20, 30])
            .run(|_| async { Attempt::Retry("x".to_string()) })
            .await;
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
