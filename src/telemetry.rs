//! Telemetry events for the breaker, the limiter, and configuration reloads.
//!
//! Components emit [`GuardEvent`]s into an [`EventSink`]. Emission is synchronous and must not
//! block: it happens on the request path, after the breaker's state lock has been released.
//!
//! ```rust
//! use storeguard::telemetry::{BreakerEvent, EventSink, GuardEvent, MemorySink};
//!
//! let sink = MemorySink::new();
//! sink.emit(GuardEvent::Breaker(BreakerEvent::Opened { failure_count: 5 }));
//! assert_eq!(sink.events().len(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Consumer of guard events.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Record one event. Implementations swallow their own failures.
    fn emit(&self, event: GuardEvent);
}

/// Events emitted by the store guard and the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    /// Circuit breaker events
    Breaker(BreakerEvent),
    /// Rate limiter events
    Limiter(LimiterEvent),
    /// Configuration reload events
    Config(ConfigEvent),
}

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Circuit transitioned to open; store calls stop until the recovery timeout elapses.
    Opened {
        /// Failures recorded when the circuit tripped
        failure_count: usize,
    },
    /// Circuit transitioned to half-open; a bounded number of probes may reach the store.
    HalfOpen,
    /// Circuit transitioned to closed; normal operation resumes.
    Closed,
    /// A store call failed or timed out.
    StoreFailed {
        /// Operation name (`get`, `set`, `delete`, `ping`)
        op: &'static str,
        /// Whether the failure was a timeout
        timeout: bool,
    },
    /// An operation was answered by the local fallback cache.
    ServedLocally { op: &'static str },
    /// An operation skipped the store under the fail-open strategy.
    Bypassed { op: &'static str },
    /// An operation was rejected under the fail-closed strategy.
    Rejected { op: &'static str },
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Request admitted.
    Allowed { scope: String, remaining: u32 },
    /// Request denied.
    Denied { scope: String, retry_after_secs: u64 },
    /// No decision could be made because bucket state was unreachable.
    Unavailable,
}

/// Events emitted by configuration reloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// A new snapshot was swapped in.
    Reloaded {
        /// Number of endpoint rules in the new snapshot
        rules: usize,
    },
    /// A candidate configuration was rejected; the previous snapshot stays active.
    Rejected { reason: String },
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::Breaker(event) => write!(f, "Breaker::{}", event),
            GuardEvent::Limiter(event) => write!(f, "Limiter::{}", event),
            GuardEvent::Config(event) => write!(f, "Config::{}", event),
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Opened { failure_count } => write!(f, "Opened(failures={})", failure_count),
            BreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            BreakerEvent::Closed => write!(f, "Closed"),
            BreakerEvent::StoreFailed { op, timeout } => {
                write!(f, "StoreFailed(op={}, timeout={})", op, timeout)
            }
            BreakerEvent::ServedLocally { op } => write!(f, "ServedLocally(op={})", op),
            BreakerEvent::Bypassed { op } => write!(f, "Bypassed(op={})", op),
            BreakerEvent::Rejected { op } => write!(f, "Rejected(op={})", op),
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Allowed { scope, remaining } => {
                write!(f, "Allowed(scope={}, remaining={})", scope, remaining)
            }
            LimiterEvent::Denied { scope, retry_after_secs } => {
                write!(f, "Denied(scope={}, retry_after={}s)", scope, retry_after_secs)
            }
            LimiterEvent::Unavailable => write!(f, "Unavailable"),
        }
    }
}

impl fmt::Display for ConfigEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigEvent::Reloaded { rules } => write!(f, "Reloaded(rules={})", rules),
            ConfigEvent::Rejected { reason } => write!(f, "Rejected({})", reason),
        }
    }
}

/// A sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: GuardEvent) {}
}

/// A sink that logs events through `tracing` at DEBUG level with structured fields.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: GuardEvent) {
        tracing::debug!(event = %event, "guard_event");
    }
}

/// A bounded in-memory sink; oldest events are evicted past capacity.
///
/// Clones share the same buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<GuardEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<GuardEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Snapshot of breaker events only, in emission order.
    pub fn breaker_events(&self) -> Vec<BreakerEvent> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                GuardEvent::Breaker(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<GuardEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: GuardEvent) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }
}
