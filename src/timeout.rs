//! Time budget for backing store calls

use crate::error::StoreError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounds a single store call. Expiry is reported as [`StoreError::Timeout`], which the
/// breaker accounts exactly like any other store failure.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Returns `None` if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Option<Self> {
        (duration > Duration::ZERO && duration < Duration::MAX).then_some(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
