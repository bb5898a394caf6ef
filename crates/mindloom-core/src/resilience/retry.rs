//! Retry with exponential backoff and jitter.
//!
//! Wraps failable async operations with a bounded number of attempts. A
//! caller-supplied policy decides which errors are worth another try; all
//! others propagate immediately.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use rand::Rng;

use crate::error::classify_error_text;

/// Smallest delay the jitter can produce.
const JITTER_FLOOR: Duration = Duration::from_millis(50);

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Base of the exponential growth.
    pub multiplier: f64,
    /// Apply symmetric +/-50% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Set the delay before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the exponential base.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (1-indexed; attempt 1 has no delay).
    ///
    /// `min(base * multiplier^(attempt-1), max_delay)`, optionally jittered
    /// by +/-50% and clamped to a small floor so jitter never produces a
    /// zero-length sleep.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());

        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }

        let mut rng = rand::thread_rng();
        let jittered = capped * rng.gen_range(0.5..=1.5);
        Duration::from_secs_f64(jittered).max(JITTER_FLOOR)
    }
}

/// Error returned when every attempt failed.
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last underlying error.
    pub last_error: E,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Wall time spent across all attempts and sleeps.
    pub elapsed: Duration,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retry exhausted after {} attempts ({:?}): {}",
            self.attempts, self.elapsed, self.last_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Decides whether an error should trigger a retry.
pub trait RetryPolicy: Send + Sync {
    /// Returns true if the operation should be retried for this error.
    fn should_retry(&self, error: &dyn std::fmt::Display) -> bool;
}

/// Retries every error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryPolicy for AlwaysRetry {
    fn should_retry(&self, _error: &dyn std::fmt::Display) -> bool {
        true
    }
}

/// Retries only errors classified as transient or capacity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl RetryPolicy for TransientOnly {
    fn should_retry(&self, error: &dyn std::fmt::Display) -> bool {
        classify_error_text(&error.to_string()).is_retryable()
    }
}

/// Counters a [`RetryExecutor`] accumulates over its lifetime.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// All attempts, successful or not.
    pub total_attempts: u64,
    /// Operations that eventually succeeded.
    pub successes: u64,
    /// Operations that exhausted their budget or hit a non-retryable error.
    pub failures: u64,
    /// Total time spent sleeping between attempts, in milliseconds.
    pub total_retry_time_ms: u64,
}

/// Executes async operations with exponential backoff and jitter.
pub struct RetryExecutor<P: RetryPolicy = AlwaysRetry> {
    config: RetryConfig,
    policy: P,
    total_attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_retry_time_ms: AtomicU64,
}

impl RetryExecutor<AlwaysRetry> {
    /// Create an executor that retries every error.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_policy(config, AlwaysRetry)
    }
}

impl<P: RetryPolicy> RetryExecutor<P> {
    /// Create an executor with a custom retryability policy.
    pub fn with_policy(config: RetryConfig, policy: P) -> Self {
        Self {
            config,
            policy,
            total_attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_retry_time_ms: AtomicU64::new(0),
        }
    }

    /// Execute `f` with retries until it succeeds, a non-retryable error
    /// surfaces, or the attempt budget is exhausted.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);

            match f().await {
                Ok(result) => {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    if attempts > 1 {
                        tracing::info!(
                            operation = name,
                            attempt = attempts,
                            elapsed = ?start.elapsed(),
                            "retry succeeded"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    let retryable =
                        self.policy.should_retry(&e) && attempts < self.config.max_attempts;

                    if !retryable {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(RetryError {
                            last_error: e,
                            attempts,
                            elapsed: start.elapsed(),
                        });
                    }

                    let delay = self.config.delay_before(attempts + 1);
                    tracing::debug!(
                        operation = name,
                        attempt = attempts,
                        next_retry_in = ?delay,
                        error = %e,
                        "retrying operation"
                    );
                    self.total_retry_time_ms
                        .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Snapshot of the executor's counters.
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_retry_time_ms: self.total_retry_time_ms.load(Ordering::Relaxed),
        }
    }

    /// The configuration this executor runs with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Imperative one-shot retry with per-call configuration.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: RetryConfig,
    name: &str,
    f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    RetryExecutor::new(config).execute(name, f).await
}

/// Retry only transient failures, per-call.
pub async fn retry_transient<F, Fut, T, E>(
    config: RetryConfig,
    name: &str,
    f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    RetryExecutor::with_policy(config, TransientOnly)
        .execute(name, f)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn config_builder() {
        let config = RetryConfig::new(5)
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(30))
            .with_multiplier(3.0)
            .with_jitter(false);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_secs(2));
        assert_eq!(config.multiplier, 3.0);
        assert!(!config.jitter);
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let config = RetryConfig::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(8))
            .with_jitter(false);

        assert_eq!(config.delay_before(1), Duration::ZERO);
        assert_eq!(config.delay_before(2), Duration::from_secs(1));
        assert_eq!(config.delay_before(3), Duration::from_secs(2));
        assert_eq!(config.delay_before(4), Duration::from_secs(4));
        // Capped from 8s onward
        assert_eq!(config.delay_before(5), Duration::from_secs(8));
        assert_eq!(config.delay_before(6), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_non_decreasing() {
        let config = RetryConfig::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        let mut prev = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = config.delay_before(attempt);
            assert!(delay >= prev, "delay shrank at attempt {attempt}");
            assert!(delay <= config.max_delay);
            prev = delay;
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::new(5).with_base_delay(Duration::from_secs(2));

        for _ in 0..100 {
            let delay = config.delay_before(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let executor = RetryExecutor::new(RetryConfig::new(3));
        let result = executor
            .execute("ok", || async { Ok::<_, std::io::Error>(7) })
            .await;

        assert_eq!(result.unwrap(), 7);
        let stats = executor.stats();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn exhaustion_carries_attempts_and_cause() {
        let config = RetryConfig::new(3)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);

        let result: Result<(), _> = executor
            .execute("fail", || async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.to_string().contains("retry exhausted"));
        assert!(err.to_string().contains("boom"));
        assert_eq!(executor.stats().failures, 1);
    }

    #[tokio::test]
    async fn eventual_success() {
        let config = RetryConfig::new(5).with_base_delay(Duration::from_millis(5));
        let executor = RetryExecutor::new(config);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .execute("flaky", || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "not yet"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let config = RetryConfig::new(5).with_base_delay(Duration::from_millis(5));
        let executor = RetryExecutor::with_policy(config, TransientOnly);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = executor
            .execute("permanent", || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "401 unauthorized",
                    ))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn imperative_api() {
        let result = retry_with_backoff(
            RetryConfig::new(2).with_base_delay(Duration::from_millis(1)),
            "one_shot",
            || async { Ok::<_, std::io::Error>("value") },
        )
        .await;

        assert_eq!(result.unwrap(), "value");
    }
}
