pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, TransitionObserver,
};
pub use retry::{retry_on_transient, retry_with_backoff, IsTransient, RetryConfig, RetryResult};
