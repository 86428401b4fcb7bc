use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricSink, Unit, names};

/// Whether a failed attempt is worth repeating. Retriability is a property
/// of the error variant, decided where the error is constructed.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(5),
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `base * 2^(attempt-1)` plus a jitter
    /// term of `base * jitter_factor * U(0,1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base.as_secs_f64() * (1u64 << exp) as f64;
        let jitter = self.base.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        Duration::from_secs_f64(scaled + jitter)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: E,
    },

    #[error("{operation} failed: {source}")]
    Fatal { operation: String, source: E },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl<E> RetryError<E> {
    /// The underlying error, when one was observed.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Drive `op` until it succeeds, fails non-retriably, or exhausts the policy.
///
/// Every attempt past the first emits `RetryAttempt`; exhaustion emits
/// `RetryExhausted`. Cancellation interrupts the backoff sleep, never the
/// caller's cleanup obligations.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    sink: &dyn MetricSink,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retriable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if attempt >= 2 {
            sink.put_metric(names::RETRY_ATTEMPT, 1.0, Unit::Count);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(source) if !source.is_retriable() => {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    source,
                });
            }
            Err(source) if attempt >= policy.max_attempts => {
                sink.put_metric(names::RETRY_EXHAUSTED, 1.0, Unit::Count);
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(source) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled {
                            operation: operation.to_string(),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::metrics::CollectingSink;

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct FlakyError {
        message: &'static str,
        retriable: bool,
    }

    impl Retriable for FlakyError {
        fn is_retriable(&self) -> bool {
            self.retriable
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            jitter_factor: 0.3,
        }
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            let floor = Duration::from_secs(5 * (1 << (attempt - 1)));
            let ceiling = floor + Duration::from_secs_f64(5.0 * 0.3);
            let delay = policy.delay(attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let sink = CollectingSink::new();
        let calls = AtomicU32::new(0);
        let result = retry(
            fast_policy(),
            &CancellationToken::new(),
            &sink,
            "flaky-op",
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FlakyError { message: "transient", retriable: true })
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.values(names::RETRY_ATTEMPT).len(), 2);
        assert!(sink.values(names::RETRY_EXHAUSTED).is_empty());
    }

    #[tokio::test]
    async fn non_retriable_error_fails_immediately() {
        let sink = CollectingSink::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            fast_policy(),
            &CancellationToken::new(),
            &sink,
            "fatal-op",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FlakyError { message: "fatal", retriable: false }) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_emits_metric_and_returns_last_error() {
        let sink = CollectingSink::new();
        let result: Result<(), _> = retry(
            fast_policy(),
            &CancellationToken::new(),
            &sink,
            "doomed-op",
            |_| async { Err(FlakyError { message: "still down", retriable: true }) },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(sink.total(names::RETRY_EXHAUSTED), 1.0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(30),
            jitter_factor: 0.0,
        };
        let result: Result<(), _> = retry(policy, &cancel, &sink, "slow-op", |_| async {
            Err(FlakyError { message: "transient", retriable: true })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    }
}
