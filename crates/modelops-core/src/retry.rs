use crate::storage::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for calls against a remote backend.
///
/// Only transient failures (see [`StorageError::is_transient`]) are retried;
/// not-found and malformed-key errors return immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based): `initial * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(retry));
        Duration::from_millis(exp.min(self.max_backoff_ms))
    }

    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> StorageResult<T>,
    ) -> StorageResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry + 1 < attempts => {
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote storage call failed, retrying"
                    );
                    thread::sleep(delay);
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let out = fast(3).run("load", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StorageError::Unavailable {
                    reason: "flaky".into(),
                })
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.expect("third attempt succeeds"), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn not_found_is_not_retried() {
        let calls = Cell::new(0);
        let err = fast(5)
            .run("load", || -> StorageResult<()> {
                calls.set(calls.get() + 1);
                Err(StorageError::NotFound { key: "k".into() })
            })
            .expect_err("not found");
        assert!(err.is_not_found());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let err = fast(2)
            .run("save", || -> StorageResult<()> {
                calls.set(calls.get() + 1);
                Err(StorageError::Unavailable {
                    reason: "down".into(),
                })
            })
            .expect_err("exhausted");
        assert!(err.is_unavailable());
        assert_eq!(calls.get(), 2);
    }
}
