//! Retry logic.
//!
//! # Responsibilities
//! - Repeat failed attempts with exponential backoff + jitter
//! - Consult the bound circuit breaker before every attempt
//! - Annotate the final failure with the attempt count
//!
//! # Design Decisions
//! - Admission errors (open circuit) are terminal and consume no attempt
//! - A timeout is retried only while the call-level deadline has time left
//! - Backoff sleeps honour both the deadline and the caller's cancellation
//! - Cancelled attempts are not reported to the breaker

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{BoxError, ResilienceError};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::timeouts::Deadline;

/// Result of a retried call plus the number of attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ResilienceError>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: Option<RetryConfig>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: Some(config),
            breaker: None,
        }
    }

    /// Single attempt, no retries; errors surface unannotated.
    pub fn once() -> Self {
        Self::default()
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.as_ref().map_or(1, |c| c.max_attempts.max(1))
    }

    /// Retry `operation` with no deadline and no cancellation.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let cancel = CancellationToken::new();
        self.run(&cancel, None, |_| {
            let fut = operation();
            async move { fut.await.map_err(ResilienceError::operation) }
        })
        .await
        .result
    }

    /// Drive attempts until success, a terminal error, or exhaustion.
    ///
    /// `attempt` receives the 1-based attempt number and must already apply
    /// any per-attempt timeout. `deadline` bounds the backoff sleeps.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<&Deadline>,
        mut attempt: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(ResilienceError::Cancelled),
                    attempts,
                };
            }

            let permit = match &self.breaker {
                Some(breaker) => match breaker.try_acquire() {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        return RetryOutcome {
                            result: Err(e),
                            attempts,
                        }
                    }
                },
                None => None,
            };

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
                result = attempt(attempts) => result,
            };

            let error = match result {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.record_success();
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };

            let counts_as_failure = matches!(
                error,
                ResilienceError::Operation(_) | ResilienceError::Timeout { .. }
            );
            if let Some(permit) = permit {
                if counts_as_failure {
                    permit.record_failure();
                }
            }

            let retryable = match &error {
                ResilienceError::Operation(_) => true,
                ResilienceError::Timeout { .. } => deadline.map_or(true, |d| !d.is_expired()),
                _ => false,
            };
            if !retryable {
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                };
            }

            let Some(config) = &self.config else {
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                };
            };

            if attempts >= max_attempts {
                tracing::debug!(attempts, error = %error, "Retries exhausted");
                return RetryOutcome {
                    result: Err(ResilienceError::RetriesExhausted {
                        attempts,
                        last: Box::new(error),
                    }),
                    attempts,
                };
            }

            let delay = calculate_backoff(config, attempts);
            tracing::debug!(attempt = attempts, delay = ?delay, error = %error, "Retrying after failure");

            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
                slept = backoff_sleep(deadline, delay) => slept,
            };
            if let Err(e) = slept {
                return RetryOutcome {
                    result: Err(e),
                    attempts,
                };
            }
        }
    }
}

async fn backoff_sleep(
    deadline: Option<&Deadline>,
    delay: std::time::Duration,
) -> Result<(), ResilienceError> {
    match deadline {
        Some(deadline) => deadline.sleep(delay).await,
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::ErrorKind;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_percent: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let handler = RetryHandler::new(config(3));
        let start = Instant::now();

        let value = handler
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky")
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let handler = RetryHandler::new(config(4));
        let start = Instant::now();

        let err = handler
            .execute(|| async { Err::<(), _>("down") })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.last_error().kind(), ErrorKind::Operation);
        assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_returns_bare_error() {
        let err = RetryHandler::once()
            .execute(|| async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_consumes_no_attempt() {
        let breaker = Arc::new(CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_timeout: Duration::from_secs(30),
                probe_count: 1,
            },
        ));
        let handler = RetryHandler::new(config(5)).with_breaker(breaker.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let outcome = handler
            .run(&cancel, None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::operation("refused"))
            })
            .await;

        // Two failures open the breaker; the third attempt is refused up front.
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let handler = RetryHandler::new(RetryConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            ..config(3)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = handler
            .run(&cancel, None, |_| async {
                Err::<(), _>(ResilienceError::operation("x"))
            })
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(outcome.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_backoff() {
        let handler = RetryHandler::new(config(10));
        let cancel = CancellationToken::new();
        let deadline = Deadline::after(Duration::from_millis(250));

        let outcome = handler
            .run(&cancel, Some(&deadline), |_| async {
                Err::<(), _>(ResilienceError::operation("x"))
            })
            .await;

        // Attempts at 0ms and 100ms; the 200ms backoff crosses the deadline.
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Timeout);
    }
}
