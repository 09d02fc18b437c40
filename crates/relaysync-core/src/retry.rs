//! Bounded exponential backoff, applied at query and sink-write boundaries

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry policy value object
///
/// `max_attempts` counts the first try, so `1` disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Result of running an operation under a policy
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    /// Retries performed (attempts beyond the first)
    pub retries: u32,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30) as i32;
        let ms = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `is_transient` decides which errors are worth another attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(v) => {
                    return Attempted {
                        result: Ok(v),
                        retries,
                    }
                }
                Err(e) => match self.next_retry(&mut retries, &e, &is_transient) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Attempted {
                            result: Err(e),
                            retries,
                        }
                    }
                },
            }
        }
    }

    /// Same as [`run`](Self::run), but every attempt gets `&mut state`
    ///
    /// For operations that own a connection they may have to drop and
    /// reopen between attempts.
    pub async fn run_with<S, T, E, F>(
        &self,
        state: &mut S,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Attempted<T, E>
    where
        S: ?Sized,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match op(&mut *state).await {
                Ok(v) => {
                    return Attempted {
                        result: Ok(v),
                        retries,
                    }
                }
                Err(e) => match self.next_retry(&mut retries, &e, &is_transient) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Attempted {
                            result: Err(e),
                            retries,
                        }
                    }
                },
            }
        }
    }

    /// Backoff before the next attempt, or `None` once `e` ends the run
    fn next_retry<E: std::fmt::Display>(
        &self,
        retries: &mut u32,
        e: &E,
        is_transient: impl Fn(&E) -> bool,
    ) -> Option<Duration> {
        if *retries + 1 >= self.max_attempts.max(1) || !is_transient(e) {
            return None;
        }
        *retries += 1;
        let delay = self.delay_for(*retries);
        debug!(error = %e, retry = *retries, ?delay, "Transient failure, backing off");
        Some(delay)
    }
}
