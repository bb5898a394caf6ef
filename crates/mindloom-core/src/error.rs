//! Shared error taxonomy.
//!
//! Library primitives surface typed errors to the caller; services convert
//! caught errors into status rows and alerts. The [`ErrorClass`] here is the
//! common vocabulary used by the retry primitive, the auto-retry manager and
//! the circuit breakers to decide whether a failure is worth another attempt.

use std::time::Duration;

/// Broad classification of a failure, used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeouts, connection resets, rate limits, 5xx-shaped
    /// statuses. Retryable; counts against circuit breakers.
    Transient,
    /// Circuit open or queue saturation. Callers should back off.
    Capacity,
    /// Schema mismatch, unknown event version, malformed payload.
    /// Non-retryable; the envelope goes to the DLQ.
    Validation,
    /// Unauthorized, invalid format, missing required field.
    /// Non-retryable; the row goes FAILED and an alert fires.
    Permanent,
}

impl ErrorClass {
    /// Whether another attempt can plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Capacity)
    }
}

/// Classify an error by its rendered message.
///
/// Status lanes persist errors as truncated text, so the auto-retry manager
/// has only the message to go on. Permanent patterns win over transient ones;
/// unknown errors default to transient, matching the relay's behavior of
/// retrying until the attempt budget runs out.
pub fn classify_error_text(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    const PERMANENT: &[&str] = &[
        "invalid json",
        "missing required field",
        "unauthorized",
        "invalid api key",
        "malformed",
        "invalid format",
    ];
    if PERMANENT.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }

    const VALIDATION: &[&str] = &["schema_mismatch", "unknown version", "unknown schema"];
    if VALIDATION.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Validation;
    }

    if lower.contains("circuit") && lower.contains("open") {
        return ErrorClass::Capacity;
    }

    ErrorClass::Transient
}

/// Error for a rejected call while a dependency's circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit '{circuit_name}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the circuit that rejected the call.
    pub circuit_name: String,
    /// Time until the circuit may admit a probe.
    pub retry_after: Duration,
}

/// Truncate an error message for persistence in a status column.
pub fn truncate_error(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns_classified() {
        assert_eq!(
            classify_error_text("connection reset by peer"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error_text("Request timeout after 30s"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error_text("429 Too Many Requests"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn permanent_patterns_classified() {
        assert_eq!(
            classify_error_text("401 Unauthorized"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error_text("invalid json in model output"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error_text("missing required field: trait_scores"),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn capacity_patterns_classified() {
        assert_eq!(
            classify_error_text("circuit 'frontier' is open, retry after 60s"),
            ErrorClass::Capacity
        );
    }

    #[test]
    fn unknown_defaults_to_transient() {
        assert_eq!(classify_error_text("something odd"), ErrorClass::Transient);
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let msg = "ошибка подключения к сервису";
        let truncated = truncate_error(msg, 10);
        assert!(truncated.len() <= 10);
        assert!(msg.starts_with(&truncated));
    }
}
