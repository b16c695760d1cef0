//! Retry policy: bounded attempts with exponential backoff.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use super::breaker::CircuitBreakerPolicy;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("circuit breaker is open")]
    CircuitOpen,
}

/// Retry policy for sends and store writes.
///
/// delay(n) = min(base_delay * multiplier^(n - 1), max_delay), then spread by
/// `jitter` (a fraction; 0.1 means ±10%).
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,

    pub jitter: f64,

    retryable: Option<RetryPredicate>,
    breaker: Option<Arc<CircuitBreakerPolicy>>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            retryable: None,
            breaker: None,
        }
    }

    /// One attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreakerPolicy>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreakerPolicy>> {
        self.breaker.as_ref()
    }

    /// Backoff before retry number `attempts` (1-indexed), without jitter.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    fn is_retryable<E: StdError + 'static>(&self, error: &E) -> bool {
        self.retryable
            .as_ref()
            .is_none_or(|predicate| predicate(error as &(dyn StdError + 'static)))
    }

    fn circuit_allows(&self) -> bool {
        self.breaker.as_ref().is_none_or(|breaker| breaker.allow())
    }

    fn record(&self, success: bool) {
        if let Some(breaker) = &self.breaker {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    /// Run `op` until it succeeds or the policy gives up. Sleeps the
    /// calling thread between attempts.
    pub fn execute<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: StdError + 'static,
    {
        let mut attempts = 0;
        loop {
            if !self.circuit_allows() {
                return Err(RetryError::CircuitOpen);
            }
            attempts += 1;
            match op() {
                Ok(value) => {
                    self.record(true);
                    return Ok(value);
                }
                Err(error) => {
                    self.record(false);
                    if attempts >= self.max_attempts || !self.is_retryable(&error) {
                        return Err(RetryError::Exhausted {
                            attempts,
                            last: error,
                        });
                    }
                    std::thread::sleep(self.jittered_delay(attempts));
                }
            }
        }
    }

    /// Async form of [`execute`](Self::execute); waits with `tokio::time::sleep`.
    pub async fn execute_async<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let mut attempts = 0;
        loop {
            if !self.circuit_allows() {
                return Err(RetryError::CircuitOpen);
            }
            attempts += 1;
            match op().await {
                Ok(value) => {
                    self.record(true);
                    return Ok(value);
                }
                Err(error) => {
                    self.record(false);
                    if attempts >= self.max_attempts || !self.is_retryable(&error) {
                        return Err(RetryError::Exhausted {
                            attempts,
                            last: error,
                        });
                    }
                    tokio::time::sleep(self.jittered_delay(attempts)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retryable", &self.retryable.is_some())
            .field("breaker", &self.breaker)
            .finish()
    }
}
