//! Retry and timeout helpers for transport operations
//!
//! Transient transport failures (registration timeouts, dial acknowledgment
//! delays) are retried locally with a bounded attempt count. Exhausting the
//! budget yields the last error rather than hanging. Configuration and state
//! errors are returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{SessionError, SessionResult};

/// Configuration for retry behavior
///
/// # Examples
///
/// ```rust
/// use call_session_core::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::fixed(10, Duration::from_millis(300));
/// assert_eq!(config.max_attempts, 10);
/// assert_eq!(config.backoff_multiplier, 1.0);
/// assert!(!config.use_jitter);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
    /// Whether to add ±10% jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Bounded attempts with a constant short delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            use_jitter: false,
        }
    }

    /// Fast retries for network operations
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// Conservative retries for re-registration after a call
    pub fn slow() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        let millis = delay.as_millis() as f64;
        Duration::from_millis((millis * (1.0 + jitter)) as u64)
    }
}

/// Retry an operation while it fails with a recoverable error
///
/// Uses [`SessionError::is_recoverable`] to decide whether another attempt
/// is worthwhile. Non-recoverable errors are returned immediately.
///
/// ```rust
/// # use call_session_core::{retry_with_backoff, RetryConfig, SessionError};
/// # use std::sync::atomic::{AtomicU32, Ordering};
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let attempts = AtomicU32::new(0);
/// let result = retry_with_backoff(
///     "register",
///     RetryConfig::fixed(3, Duration::from_millis(1)),
///     || async {
///         if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err(SessionError::transport("timeout"))
///         } else {
///             Ok(7)
///         }
///     },
/// )
/// .await;
/// assert_eq!(result.unwrap(), 7);
/// # }
/// ```
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> SessionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = config.max_attempts,
            "Attempting operation"
        );

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt = attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) if e.is_recoverable() && attempt < config.max_attempts => {
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    category = e.category(),
                    next_delay_ms = delay.as_millis() as u64,
                    "Recoverable error, will retry"
                );
                sleep(config.jittered(delay)).await;
                delay = config.next_delay(delay);
            }
            Err(e) => {
                if e.is_recoverable() {
                    error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                } else {
                    error!(
                        operation = operation_name,
                        error = %e,
                        category = e.category(),
                        "Non-recoverable error, not retrying"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Bound an operation by a timeout, mapping expiry to
/// [`SessionError::OperationTimeout`]
pub async fn with_timeout<T, F>(
    operation_name: &str,
    timeout: Duration,
    future: F,
) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(SessionError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Attach operation context to an error
///
/// The error variant is preserved so callers can still match on it; the
/// context is written to the log.
pub trait ErrorContext<T> {
    fn context(self, context: &str) -> SessionResult<T>;

    fn with_context<F>(self, f: F) -> SessionResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for SessionResult<T> {
    fn context(self, context: &str) -> SessionResult<T> {
        self.map_err(|e| {
            error!(error = %e, context = context, category = e.category(), "Operation failed with context");
            e
        })
    }

    fn with_context<F>(self, f: F) -> SessionResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context = f();
            error!(error = %e, context = %context, category = e.category(), "Operation failed with context");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: SessionResult<()> = retry_with_backoff(
            "dial",
            RetryConfig::fixed(3, Duration::from_millis(1)),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SessionError::transport("no ack"))
            },
        )
        .await;

        assert!(matches!(result, Err(SessionError::Transport { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: SessionResult<()> = retry_with_backoff(
            "connect",
            RetryConfig::fixed(5, Duration::from_millis(1)),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SessionError::InvalidConfiguration {
                    field: "password".into(),
                    reason: "empty".into(),
                })
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_operation_timeout() {
        let result: SessionResult<()> = with_timeout("register", Duration::from_millis(10), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(SessionError::OperationTimeout { operation, duration_ms }) => {
                assert_eq!(operation, "register");
                assert_eq!(duration_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            use_jitter: false,
        };
        let second = config.next_delay(config.initial_delay);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(config.next_delay(second), Duration::from_millis(250));
    }

    #[test]
    fn context_preserves_variant() {
        let result: SessionResult<()> = Err(SessionError::NotInitialized);
        assert!(matches!(result.context("make_call"), Err(SessionError::NotInitialized)));
    }
}
