//! Exponential backoff retry with jitter.
//!
//! Generalizes the donor `tooling::async_utils::retry::RetryPolicy`
//! (renamed fields, typed `should_retry` predicate instead of string
//! matching) and follows the jitter formula of the original kernel's
//! `async_retry`: jitter is computed as a fraction of the *current*
//! delay and the jittered result is clamped to `[0, max_delay]` — the
//! donor's own policy instead clamps before jittering, which is
//! recorded as a resolved open question in `DESIGN.md`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(&'static str),
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), RetryError> {
        if self.max_attempts == 0 {
            return Err(RetryError::InvalidPolicy("max_attempts must be >= 1"));
        }
        if self.multiplier < 1.0 {
            return Err(RetryError::InvalidPolicy("multiplier must be >= 1.0"));
        }
        Ok(())
    }

    /// Compute the next delay given the current delay, applying jitter
    /// and clamping to `[0, max_delay]`.
    fn next_delay(&self, current: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return current.min(self.max_delay);
        }
        let delay_secs = current.as_secs_f64();
        let jitter = delay_secs * self.jitter_ratio;
        let sampled = rand::thread_rng().gen_range(-jitter..=jitter);
        let jittered = (delay_secs + sampled).max(0.0).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }

    fn advance(&self, current: Duration) -> Duration {
        let advanced = current.as_secs_f64() * self.multiplier;
        Duration::from_secs_f64(advanced.min(self.max_delay.as_secs_f64()))
    }
}

/// Default retriable-error classification: transient I/O and timeout
/// conditions, mirroring the original `(TimeoutError, ConnectionError,
/// OSError)` default.
pub fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted | Interrupted
            | WouldBlock | BrokenPipe
    )
}

/// Run `operation` under `policy`, retrying while `should_retry(&err)`
/// holds and attempts remain. On exhaustion, returns the last error.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1usize;
    let mut delay = policy.initial_delay;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let sleep_for = policy.next_delay(delay);
                tokio::time::sleep(sleep_for).await;
                delay = policy.advance(delay);
                attempt += 1;
            }
        }
    }
}
