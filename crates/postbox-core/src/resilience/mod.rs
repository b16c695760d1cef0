//! Resilience: retry with backoff, a call-level circuit breaker, and the
//! topic breaker used by sweeps.

pub mod breaker;
pub mod retry;
pub mod topic_breaker;

pub use self::breaker::{CircuitBreakerPolicy, CircuitState};
pub use self::retry::{RetryError, RetryPolicy, RetryPredicate};
pub use self::topic_breaker::{InMemoryOutboxCircuitBreaker, OutboxCircuitBreaker};
