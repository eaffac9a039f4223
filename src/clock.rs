//! Clock abstractions used by the circuit breaker, the fallback cache, and token buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Two timelines are exposed. `now_millis` is monotonic and drives breaker recovery and TTLs
/// that never leave the process. `epoch_seconds` is wall time and stamps persisted buckets,
/// which must be comparable across processes.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic milliseconds since an arbitrary, clock-local origin. Never decreases.
    fn now_millis(&self) -> u64;

    /// Fractional seconds since the Unix epoch. May step backwards.
    fn epoch_seconds(&self) -> f64;
}

/// Production clock: `Instant` for `now_millis`, `SystemTime` for `epoch_seconds`.
///
/// Notes: the monotonic origin is the clock's construction, so `now_millis` values are only
/// comparable between calls on the same clock. Buckets clamp negative elapsed wall time to zero.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn epoch_seconds(&self) -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Manually driven clock with microsecond resolution.
///
/// Clones share the same instant, so a test can hand one clone to the breaker and keep
/// another to advance time. [`advance`](Self::advance) moves both timelines;
/// [`rewind`](Self::rewind) steps only the wall clock back, as an NTP correction would.
#[derive(Debug, Clone)]
pub struct ManualClock {
    monotonic_micros: Arc<AtomicU64>,
    wall_micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the wall clock at `epoch_seconds` past the Unix epoch and the monotonic clock at 0.
    pub fn new(epoch_seconds: u64) -> Self {
        Self {
            monotonic_micros: Arc::new(AtomicU64::new(0)),
            wall_micros: Arc::new(AtomicU64::new(epoch_seconds.saturating_mul(1_000_000))),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.monotonic_micros.fetch_add(micros, Ordering::SeqCst);
        self.wall_micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Step the wall clock backward. Monotonic time is unaffected.
    pub fn rewind(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .wall_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(cur.saturating_sub(micros)));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.monotonic_micros.load(Ordering::SeqCst) / 1_000
    }

    fn epoch_seconds(&self) -> f64 {
        self.wall_micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}
