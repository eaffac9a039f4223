//! Error types for the store guard, the rate limiter, and configuration loading.
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the backing store (network, timeout, or protocol).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its time budget.
    #[error("backing store call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The store answered with something we could not interpret.
    #[error("backing store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Access timeout details as `(elapsed, limit)`.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Errors surfaced by [`CircuitBreaker`](crate::CircuitBreaker) operations.
///
/// Store failures have already been counted against the breaker by the time a caller
/// sees one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError {
    /// The circuit is open (or its half-open probes are all in flight) and the strategy is
    /// fail-closed. `retry_in` is `None` when the breaker is waiting on probes rather than on
    /// the recovery timeout.
    #[error("circuit breaker open ({failure_count} failures)")]
    CircuitOpen { failure_count: usize, retry_in: Option<Duration> },
    /// The store call failed and the strategy is fail-closed.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl BreakerError {
    /// Check if this error is a fail-closed rejection by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error carries a store failure.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Time until the breaker will next admit a probe, when it is known.
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_in, .. } => *retry_in,
            _ => None,
        }
    }

    /// Borrow the store error if present.
    pub fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            Self::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// A persisted bucket could not be decoded. Always recovered by starting a fresh bucket.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes are not a bucket document.
    #[error("malformed bucket: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Document parsed but violates bucket invariants.
    #[error("invalid bucket field `{field}`: {value}")]
    InvalidField { field: &'static str, value: f64 },
}

/// Rejected configuration. The previously active configuration stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A rule limit must be at least 1 request per minute.
    #[error("rule `{pattern}`: limit must be >= 1 (got {limit})")]
    InvalidLimit { pattern: String, limit: i64 },
    /// A burst allowance cannot be negative.
    #[error("rule `{pattern}`: burst must be >= 0 (got {burst})")]
    InvalidBurst { pattern: String, burst: i64 },
    /// Route pattern is not an absolute path or misuses the wildcard.
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
    /// Neither IP- nor user-scoped limiting is enabled.
    #[error("at least one of use_ip_based or use_user_based must be enabled")]
    NoScopeEnabled,
    /// A duration or count that must be positive was zero.
    #[error("{field} must be > 0")]
    NotPositive { field: &'static str },
    /// Bucket keys need a namespace.
    #[error("key_prefix must be non-empty and must not contain ':' or whitespace")]
    InvalidKeyPrefix,
    /// Degraded mode needs somewhere to degrade to.
    #[error("degraded strategy requires the local fallback cache")]
    DegradedWithoutLocalCache,
    /// Configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// Configuration source could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// The limiter could not reach a decision because its bucket store is unavailable.
///
/// Deliberately distinct from a denial: callers choose how to treat the ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// Bucket state could not be loaded or persisted through the breaker.
    #[error("rate limiter unavailable: {source}")]
    Unavailable {
        #[source]
        source: BreakerError,
    },
}

impl From<BreakerError> for LimiterError {
    fn from(source: BreakerError) -> Self {
        Self::Unavailable { source }
    }
}

impl LimiterError {
    /// The breaker error behind this condition.
    pub fn breaker_error(&self) -> &BreakerError {
        match self {
            Self::Unavailable { source } => source,
        }
    }
}
