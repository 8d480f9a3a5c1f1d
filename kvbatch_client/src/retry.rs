//! Bounded retries of transient failures.
use std::{future::Future, time::Duration};

use observability_deps::tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Retry budget of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    pub max_retries: u32,

    /// Pause before each additional attempt.
    pub sleep_between_retries: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(500),
        }
    }
}

/// Attempt counter of one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far.
    pub attempt: u32,

    /// Attempts allowed in total.
    pub max_attempts: u32,
}

impl RetryState {
    fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_retries.saturating_add(1),
        }
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// A failure that retrying cannot fix.
    #[error(transparent)]
    Terminal(E),

    /// Every attempt failed transiently.
    #[error("giving up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: E,
    },

    /// Cancelled before the next attempt could start.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
    },
}

impl From<RetryError<Self>> for Error {
    fn from(e: RetryError<Self>) -> Self {
        match e {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { attempts, source } => Self::RetriesExhausted {
                attempts,
                source: Box::new(source),
            },
            RetryError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

/// Reissues an operation while it fails transiently.
///
/// The controller knows nothing about the operation: it is given "attempt this" and
/// "is this failure transient" and nothing else. The operation receives the 1-based attempt
/// number.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Create a controller with the given budget.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, fails terminally, runs out of attempts or `cancel` fires.
    ///
    /// Cancellation never interrupts an attempt in flight; it prevents the next one and
    /// cuts short the pause between attempts.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        is_transient: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        C: Fn(&E) -> bool + Send + Sync,
        E: std::fmt::Display + Send,
        T: Send,
    {
        let mut state = RetryState::new(&self.config);
        loop {
            if cancel.is_cancelled() {
                debug!(operation, attempts = state.attempt, "operation cancelled");
                return Err(RetryError::Cancelled {
                    attempts: state.attempt,
                });
            }

            state.attempt += 1;
            let e = match op(state.attempt).await {
                Ok(v) => {
                    if state.attempt > 1 {
                        debug!(operation, attempts = state.attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => e,
            };

            if !is_transient(&e) {
                return Err(RetryError::Terminal(e));
            }

            if state.exhausted() {
                warn!(
                    operation,
                    attempts = state.attempt,
                    error = %e,
                    "retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: state.attempt,
                    source: e,
                });
            }

            info!(
                operation,
                attempt = state.attempt,
                max_attempts = state.max_attempts,
                error = %e,
                "transient failure, retrying"
            );

            let pause = self.config.sleep_between_retries;
            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(operation, attempts = state.attempt, "operation cancelled during backoff");
                        return Err(RetryError::Cancelled { attempts: state.attempt });
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use crate::testing::TestError;

    use super::*;

    fn retry(max_retries: u32) -> Retry {
        Retry::new(RetryConfig {
            max_retries,
            sleep_between_retries: Duration::ZERO,
        })
    }

    /// Fails transiently `failures` times, then succeeds.
    async fn flaky(retry: &Retry, failures: u32) -> (Result<u32, RetryError<TestError>>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let res = retry
            .run(
                "flaky",
                &CancellationToken::new(),
                TestError::is_retryable,
                |attempt| {
                    let calls = Arc::clone(&calls);
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(n, attempt);
                        if n <= failures {
                            Err(TestError::RETRY)
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;
        (res, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_success_within_budget() {
        let retry = retry(2);
        for failures in 0..=2 {
            let (res, calls) = flaky(&retry, failures).await;
            assert_eq!(res.unwrap(), failures + 1);
            assert_eq!(calls, failures + 1);
        }
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let (res, calls) = flaky(&retry(2), 3).await;
        assert_eq!(calls, 3);
        match res {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_retryable());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_retries() {
        let (res, calls) = flaky(&retry(0), 1).await;
        assert_eq!(calls, 1);
        assert!(matches!(res, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_terminal_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry(5)
            .run(
                "terminal",
                &CancellationToken::new(),
                TestError::is_retryable,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::NO_RETRY) }
                },
            )
            .await;

        assert!(matches!(res, Err(RetryError::Terminal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let retry = Retry::new(RetryConfig {
            max_retries: 10,
            sleep_between_retries: Duration::from_secs(3600),
        });

        let calls = AtomicU32::new(0);
        let run = retry.run("cancelled", &cancel, TestError::is_retryable, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::RETRY) }
        });

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };

        let (res, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, canceller)
        })
        .await
        .expect("cancellation must end the backoff");

        assert!(matches!(res, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = AtomicU32::new(0);
        let res = retry(2)
            .run("never", &cancel, TestError::is_retryable, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), TestError>(()) }
            })
            .await;
        assert!(matches!(res, Err(RetryError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_into_client_error() {
        let e: Error = RetryError::Cancelled { attempts: 2 }.into();
        assert!(matches!(e, Error::Cancelled));

        let e: Error = RetryError::Exhausted {
            attempts: 3,
            source: Error::Timeout {
                node: Arc::from("node-b"),
                timeout: Duration::from_millis(10),
            },
        }
        .into();
        assert!(matches!(e, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(!e.is_transient());
    }
}
