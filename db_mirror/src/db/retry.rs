//! Retry with exponential backoff for transient connection failures
//!
//! Only [`crate::Error::is_transient`] failures are retried. Semantic failures (DDL
//! errors, constraint violations) are returned on the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::db::handle::DatabaseHandle;
use crate::error::Result;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        if factor <= 1.0 {
            return self.initial_delay.min(self.max_delay);
        }
        if self.initial_delay.as_secs_f64() * factor >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor)
    }

    /// Run `op`, retrying transient failures. Between attempts the handle, if
    /// given, is asked to replace its session.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        handle: Option<&dyn DatabaseHandle>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = jittered(self.delay_for(attempt));
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(handle) = handle {
                        if let Err(reconnect_err) = handle.reconnect().await {
                            tracing::warn!(handle = handle.label(), error = %reconnect_err, "Reconnect failed");
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation = what, attempts = attempt, error = %e, "Giving up");
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}
