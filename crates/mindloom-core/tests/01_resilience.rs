// tests/01_resilience.rs
//
// The resilience primitives under end-to-end conditions: a failing model
// dependency trips its breaker after the configured number of consecutive
// failures, rejections carry retry_after, recovery goes through half-open,
// and retry delays stay bounded and non-decreasing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mindloom_core::resilience::{
    retry_transient, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig,
    RetryExecutor,
};

#[tokio::test]
async fn breaker_protects_a_failing_model_endpoint() {
    let breaker = CircuitBreaker::new(
        "model:frontier",
        CircuitBreakerConfig::new(5).with_timeout(Duration::from_millis(60)),
    );

    // Five consecutive failing calls open the circuit.
    for _ in 0..5 {
        let result: Result<(), _> = breaker
            .call(|| async {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "request timeout",
                ))
            })
            .await;
        assert!(result.is_err());
    }

    // The sixth call is rejected instantly with retry_after.
    let rejection = breaker.check().unwrap_err();
    assert_eq!(rejection.circuit_name, "model:frontier");
    assert!(rejection.retry_after > Duration::ZERO);
    assert!(rejection.retry_after <= Duration::from_millis(60));

    // After the timeout, one probe is admitted and a success closes the
    // circuit with the timeout back at base.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let probe = breaker
        .call(|| async { Ok::<_, std::io::Error>("recovered") })
        .await;
    assert!(probe.is_ok());
    assert_eq!(
        breaker.stats().current_timeout,
        Duration::from_millis(60)
    );
}

#[tokio::test]
async fn open_timeout_grows_until_the_cap() {
    let breaker = CircuitBreaker::new(
        "flappy",
        CircuitBreakerConfig::new(1)
            .with_timeout(Duration::from_millis(10))
            .with_max_timeout(Duration::from_millis(40)),
    );

    let mut observed = Vec::new();
    for _ in 0..4 {
        breaker.record_failure();
        observed.push(breaker.stats().current_timeout);
        tokio::time::sleep(breaker.stats().current_timeout + Duration::from_millis(5)).await;
        // Probe fails, reopening with a grown timeout.
        let _ = breaker.check();
    }

    // Strictly grows, then caps.
    assert!(observed.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(*observed.last().unwrap(), Duration::from_millis(40));
}

#[tokio::test]
async fn registry_reset_restores_every_breaker() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new(1));
    for name in ["model:frontier", "model:mid", "postgres"] {
        registry.get_or_create(name).record_failure();
    }
    assert!(registry
        .all_stats()
        .iter()
        .all(|(_, stats)| stats.state == mindloom_core::resilience::CircuitState::Open));

    registry.reset_all();
    assert!(registry
        .all_stats()
        .iter()
        .all(|(_, stats)| stats.state == mindloom_core::resilience::CircuitState::Closed));
}

#[tokio::test]
async fn retry_delays_are_bounded_and_non_decreasing() {
    let config = RetryConfig::new(8)
        .with_base_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(400))
        .with_jitter(false);

    let mut previous = Duration::ZERO;
    for attempt in 2..=8 {
        let delay = config.delay_before(attempt);
        assert!(delay >= previous);
        assert!(delay <= Duration::from_millis(400));
        previous = delay;
    }
}

#[tokio::test]
async fn transient_retry_gives_up_on_permanent_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result: Result<(), _> = retry_transient(
        RetryConfig::new(5).with_base_delay(Duration::from_millis(1)),
        "model_call",
        move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "401 unauthorized",
                ))
            }
        },
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn executor_counters_accumulate() {
    let executor = RetryExecutor::new(
        RetryConfig::new(3).with_base_delay(Duration::from_millis(1)),
    );
    let flaky = Arc::new(AtomicU32::new(0));
    let flaky_clone = flaky.clone();

    executor
        .execute("flaky", move || {
            let flaky = flaky_clone.clone();
            async move {
                if flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "reset"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    let stats = executor.stats();
    assert_eq!(stats.total_attempts, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 0);
}
