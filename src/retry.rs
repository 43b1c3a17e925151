//! Bounded retry executor
//!
//! Runs a fallible async operation up to [`RetryPolicy::max_attempts`] times.
//! Two optional modifiers shape the run:
//! - a rate-limit window: every attempt occupies at least `window`, success
//!   included, which keeps a sequence of calls under a handshake quota;
//! - an overall timeout covering all attempts and back-off sleeps.
//!
//! Every sleep and every attempt is raced against a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a retry run stopped without a result from the operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The overall time budget elapsed.
    Timeout(Duration),
    /// The cancellation token fired.
    Cancelled,
}

/// Errors the executor knows how to classify.
pub trait RetryableError: From<Interrupted> + std::fmt::Display {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Delay growth between failed attempts.
///
/// The delay for attempt `n` is `first × factor^n`, clamped to `max`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay following the given (0-indexed) failed attempt.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// How many times to try and how long to wait in between.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A configured retry run.
#[derive(Clone, Debug)]
pub struct Retry {
    policy: RetryPolicy,
    rate_limit: Option<Duration>,
    timeout: Option<Duration>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rate_limit: None,
            timeout: None,
        }
    }

    /// Every attempt takes at least `window`, measured from its start.
    pub fn with_rate_limit(mut self, window: Duration) -> Self {
        self.rate_limit = Some(window);
        self
    }

    /// Bounds the whole run, back-off sleeps included.
    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.timeout = Some(budget);
        self
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts its attempts. The last error is returned verbatim.
    ///
    /// `op` receives the 0-indexed attempt number.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        let attempts = async {
            let mut attempt = 0;
            loop {
                let started = Instant::now();
                let result = op(attempt).await;

                if let Some(window) = self.rate_limit {
                    sleep_until(started + window).await;
                }

                match result {
                    Ok(value) => return Ok(value),
                    Err(e) if !e.is_retryable() => {
                        debug!(attempt, error = %e, "Non-retryable error, giving up");
                        return Err(e);
                    }
                    Err(e) if attempt + 1 >= max_attempts => {
                        warn!(attempt, max_attempts, error = %e, "Retry attempts exhausted");
                        return Err(e);
                    }
                    Err(e) => {
                        let delay = self.policy.backoff.next(attempt);
                        warn!(attempt, ?delay, error = %e, "Attempt failed, retrying");
                        sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        };

        let bounded = async {
            match self.timeout {
                Some(budget) => timeout(budget, attempts)
                    .await
                    .unwrap_or_else(|_| Err(E::from(Interrupted::Timeout(budget)))),
                None => attempts.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(E::from(Interrupted::Cancelled)),
            result = bounded => result,
        }
    }
}
