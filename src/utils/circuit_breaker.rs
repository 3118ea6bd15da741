use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards the shared producer connection. After `failure_threshold`
// consecutive send failures the breaker opens and publishes fail fast with
// `CircuitBreakerError::CircuitOpen` until `open_timeout` has elapsed; then a
// half-open probe period needs `success_threshold` successes to close again.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Too many failures, requests blocked immediately
// - HalfOpen: Testing if the broker recovered
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics registry (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing
    pub open_timeout: Duration,
    /// Probe successes needed to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

pub type TransitionObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    observer: Option<TransitionObserver>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn move_to(&mut self, next: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == next {
            return None;
        }
        let previous = self.state;
        self.state = next;
        match next {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.probe_successes = 0;
                self.opened_at = None;
            }
            CircuitState::Open => {
                self.probe_successes = 0;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                self.probe_successes = 0;
            }
        }
        Some((previous, next))
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
            })),
            observer: None,
        }
    }

    /// Called with `(from, to)` on every state change.
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let transition = {
            let mut inner = self.inner.lock().await;
            if inner.state != CircuitState::Open {
                return Ok(());
            }
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed < self.config.open_timeout {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            inner.move_to(CircuitState::HalfOpen)
        };
        self.notify(transition);
        Ok(())
    }

    async fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.config.success_threshold {
                        inner.move_to(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    async fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures += 1;
            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.move_to(CircuitState::Open)
                }
                CircuitState::HalfOpen => inner.move_to(CircuitState::Open),
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Manually close the breaker
    pub async fn reset(&self) {
        let transition = self.inner.lock().await.move_to(CircuitState::Closed);
        self.notify(transition);
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn breaker(failures: u32, timeout: Duration, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                open_timeout: timeout,
                success_threshold: successes,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, Duration::from_secs(1), 2);

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("error") }).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(1), 1);

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("error") }).await;
        }
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        let _ = cb.call(async { Err::<(), _>("error") }).await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let transitions = Arc::new(StdMutex::new(Vec::new()));
        let sink = transitions.clone();
        let cb = breaker(2, Duration::from_millis(50), 1).with_observer(Arc::new(move |from, to| {
            sink.lock().unwrap().push((from, to));
        }));

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }
}
