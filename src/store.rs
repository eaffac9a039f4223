//! Backing store abstraction and an in-process implementation.
//!
//! [`BackingStore`] is the contract the circuit breaker mediates: a networked key-value store
//! with per-key expiry. Any store implementing it suffices; see the `storeguard-redis` crate for
//! a Redis-backed one.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstract key-value store reached over the network.
///
/// Implementations perform exactly one attempt per call; retry and timeout policy belong to
/// the caller.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Fetch the raw value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`. With `ttl`, the key expires after that long.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at_millis: Option<u64>,
}

impl StoredValue {
    fn expired(&self, now: u64) -> bool {
        self.expires_at_millis.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct Faults {
    available: bool,
    fail_next: usize,
    latency: Duration,
}

/// How often a write sweeps expired keys out of the map.
const SWEEP_INTERVAL_MILLIS: u64 = 1_000;

#[derive(Debug)]
struct Data {
    entries: HashMap<String, StoredValue>,
    last_sweep_millis: u64,
}

impl Data {
    fn sweep(&mut self, now: u64) {
        self.entries.retain(|_, v| !v.expired(now));
        self.last_sweep_millis = now;
    }
}

#[derive(Debug)]
struct Inner {
    data: Mutex<Data>,
    faults: Mutex<Faults>,
    calls: AtomicUsize,
    clock: Arc<dyn Clock>,
}

/// In-process [`BackingStore`] with TTL expiry and fault injection.
///
/// Clones share the same data. Useful as a single-instance store and for exercising the
/// breaker: failures, outages, and latency can be switched on at runtime.
///
/// Expired keys are dropped when read, and writes sweep the whole map at most once per
/// second, so keys that are never read again do not accumulate.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::default())
    }

    /// Use `clock` for key expiry.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data { entries: HashMap::new(), last_sweep_millis: 0 }),
                faults: Mutex::new(Faults {
                    available: true,
                    fail_next: 0,
                    latency: Duration::ZERO,
                }),
                calls: AtomicUsize::new(0),
                clock: Arc::new(clock),
            }),
        }
    }

    /// Make the next `n` calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.faults().fail_next = n;
    }

    /// Simulate a full outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.faults().available = available;
    }

    /// Delay every call by `latency` before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = latency;
    }

    /// Number of calls that reached the store, including failed ones.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Remaining time-to-live for `key`, if it exists and has one.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.inner.clock.now_millis();
        let data = self.data();
        let expires = data.entries.get(key)?.expires_at_millis?;
        Some(Duration::from_millis(expires.saturating_sub(now)))
    }

    /// Number of live keys. Expired keys are swept first.
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now_millis();
        let mut data = self.data();
        data.sweep(now);
        data.entries.len()
    }

    /// Returns true if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> std::sync::MutexGuard<'_, Data> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let (latency, outcome) = {
            let mut faults = self.faults();
            let outcome = if !faults.available {
                Err(StoreError::Unavailable(format!("{op}: store offline")))
            } else if faults.fail_next > 0 {
                faults.fail_next -= 1;
                Err(StoreError::Unavailable(format!("{op}: injected failure")))
            } else {
                Ok(())
            };
            (faults.latency, outcome)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.enter("get").await?;
        let now = self.inner.clock.now_millis();
        let mut data = self.data();
        let expired = match data.entries.get(key) {
            Some(v) => v.expired(now),
            None => return Ok(None),
        };
        if expired {
            data.entries.remove(key);
            return Ok(None);
        }
        Ok(data.entries.get(key).map(|v| v.bytes.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.enter("set").await?;
        let now = self.inner.clock.now_millis();
        let expires_at_millis = ttl.map(|ttl| {
            now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        });
        let mut data = self.data();
        if now.saturating_sub(data.last_sweep_millis) >= SWEEP_INTERVAL_MILLIS {
            data.sweep(now);
        }
        data.entries.insert(key.to_string(), StoredValue { bytes: value.to_vec(), expires_at_millis });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("delete").await?;
        let now = self.inner.clock.now_millis();
        Ok(self.data().entries.remove(key).is_some_and(|v| !v.expired(now)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter("ping").await
    }
}
