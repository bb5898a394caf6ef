//! Circuit breaker pattern for fail-fast behavior.
//!
//! Prevents cascading failures by stopping calls to a dependency that is
//! known to be failing. Each OPEN transition grows the recovery timeout
//! geometrically, capped at a maximum, so a flapping dependency is probed
//! less and less often.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CircuitOpenError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A probe request is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before the first probe.
    pub base_timeout: Duration,
    /// Growth factor applied to the timeout on every OPEN transition.
    pub timeout_multiplier: f64,
    /// Cap for the grown timeout.
    pub max_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            base_timeout: Duration::from_secs(60),
            timeout_multiplier: 2.0,
            max_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with the given failure threshold.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            ..Default::default()
        }
    }

    /// Set the success threshold for closing from half-open.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the base open timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    /// Set the timeout growth factor.
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the timeout cap.
    pub fn with_max_timeout(mut self, max: Duration) -> Self {
        self.max_timeout = max;
        self
    }
}

/// Mutable state guarded by the breaker's lock.
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    current_timeout: Duration,
    state_changed_at: Instant,
    state_changes: u64,
}

/// Statistics snapshot for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Total calls admitted or rejected.
    pub total_calls: u64,
    /// Calls that completed successfully.
    pub successful_calls: u64,
    /// Calls that failed and counted against the breaker.
    pub failed_calls: u64,
    /// Calls rejected while open.
    pub rejected_calls: u64,
    /// Number of state transitions.
    pub state_changes: u64,
    /// Current open timeout.
    pub current_timeout: Duration,
    /// Time since the last state change.
    pub time_in_state: Duration,
}

/// Circuit breaker for a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    /// Decides whether an error counts as a failure. `None` counts all.
    failure_filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let base = config.base_timeout;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                current_timeout: base,
                state_changed_at: Instant::now(),
                state_changes: 0,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            failure_filter: None,
        }
    }

    /// Only errors matching `filter` count against the breaker; all others
    /// propagate without affecting state.
    pub fn with_failure_filter(
        mut self,
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.failure_filter = Some(Box::new(filter));
        self
    }

    /// The circuit name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a call may proceed.
    ///
    /// Returns `Err(CircuitOpenError)` with `retry_after` while the circuit
    /// is open and the timeout has not elapsed.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);

                if elapsed >= inner.current_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpenError {
                        circuit_name: self.name.clone(),
                        retry_after: inner.current_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.current_timeout = self.config.base_timeout;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Whether `error` counts as a failure for this breaker.
    pub fn counts_as_failure(&self, error: &str) -> bool {
        match &self.failure_filter {
            Some(filter) => filter(error),
            None => true,
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Errors not matching the failure filter propagate without affecting
    /// breaker state.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.check().map_err(CircuitBreakerError::CircuitOpen)?;

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                if self.counts_as_failure(&e.to_string()) {
                    self.record_failure();
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Current state (transitions to half-open if the timeout elapsed).
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= inner.current_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }
        inner.state
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_changes: inner.state_changes,
            current_timeout: inner.current_timeout,
            time_in_state: inner.state_changed_at.elapsed(),
        }
    }

    /// Force the breaker back to closed with the base timeout.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.current_timeout = self.config.base_timeout;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn open(&self, inner: &mut Inner) {
        // The first open waits the base timeout; every re-open from a failed
        // probe grows the wait geometrically, capped at max_timeout.
        if inner.state == CircuitState::HalfOpen {
            let grown = inner.current_timeout.as_secs_f64() * self.config.timeout_multiplier;
            inner.current_timeout =
                Duration::from_secs_f64(grown.min(self.config.max_timeout.as_secs_f64()));
        }
        inner.opened_at = Some(Instant::now());
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;
        inner.state_changed_at = Instant::now();
        inner.state_changes += 1;
        inner.failure_count = 0;
        inner.success_count = 0;

        tracing::info!(
            circuit = %self.name,
            old_state = %old_state,
            new_state = %new_state,
            timeout = ?inner.current_timeout,
            "circuit breaker state changed"
        );
    }
}

/// Error type for calls routed through a circuit breaker.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open.
    CircuitOpen(CircuitOpenError),
    /// The inner operation failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen(e) => write!(f, "{}", e),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::CircuitOpen(e) => Some(e),
            CircuitBreakerError::Inner(e) => Some(e),
        }
    }
}

/// Process-scoped registry of circuit breakers, indexed by name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry with a default configuration for new breakers.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get or create a breaker by name.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Get a breaker if it exists.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.clone())
    }

    /// Register a breaker with a custom config, replacing any existing one.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Aggregated stats for every registered breaker.
    pub fn all_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Reset every breaker to closed. Used by tests and ops tooling.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
