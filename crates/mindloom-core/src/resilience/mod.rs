//! Resilience primitives shared by every service.
//!
//! - **Retry**: exponential backoff with jitter and a retryability policy
//! - **Circuit breaker**: per-dependency state machine with geometric
//!   timeout growth and a process-scoped registry
//!
//! # Example
//!
//! ```rust,ignore
//! use mindloom_core::resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor,
//! };
//!
//! let retry = RetryExecutor::new(RetryConfig::default());
//! let result = retry.execute("fetch_profile", || async {
//!     Ok::<_, std::io::Error>("profile")
//! }).await;
//!
//! let cb = CircuitBreaker::new("model_api", CircuitBreakerConfig::default());
//! let result = cb.call(|| async {
//!     Ok::<_, std::io::Error>("response")
//! }).await;
//! ```

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use retry::{
    retry_transient, retry_with_backoff, AlwaysRetry, RetryConfig, RetryError, RetryExecutor,
    RetryPolicy, RetryStats, TransientOnly,
};
