//! Circuit breaker mediating every backing store call, with a local fallback cache.
//!
//! The breaker decides per call whether to proxy to the store, answer from the
//! [`LocalFallbackCache`], bypass the store, or reject, based on its state and the configured
//! [`FailureStrategy`]. All breaker state lives in one mutex that is held only around state
//! transitions, never across the store call itself.
//!
//! Trip accounting is best-effort under concurrency: calls admitted while the circuit was closed
//! may complete after it trips and still record their failures, so `failure_count` can end up
//! slightly above `failure_threshold`. Each transition is still linearizable with respect to the
//! state lock and happens exactly once.

use crate::cache::{LocalCacheConfig, LocalFallbackCache};
use crate::clock::{Clock, SystemClock};
use crate::error::{BreakerError, ConfigError, StoreError};
use crate::store::BackingStore;
use crate::task::BackgroundTask;
use crate::telemetry::{BreakerEvent, EventSink, GuardEvent, NullSink};
use crate::timeout::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Store calls are short-circuited until the recovery timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// What the breaker does with a call it will not send to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Skip the store: reads see nothing, writes are dropped.
    FailOpen,
    /// Reject with an error.
    FailClosed,
    /// Serve reads and writes from the local fallback cache.
    #[default]
    Degraded,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStrategy::FailOpen => "FAIL_OPEN",
            FailureStrategy::FailClosed => "FAIL_CLOSED",
            FailureStrategy::Degraded => "DEGRADED",
        })
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
    half_open_max_probe: usize,
    strategy: FailureStrategy,
    call_timeout: Duration,
    health_check_interval: Duration,
    local_cache: Option<LocalCacheConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_probe: 3,
            strategy: FailureStrategy::Degraded,
            call_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(10),
            local_cache: Some(LocalCacheConfig::default()),
        }
    }
}

impl CircuitBreakerConfig {
    /// Start from the defaults: 5 failures, 30s recovery, 3 probes, degraded, 1s call timeout,
    /// 10s health checks, 1000-entry / 300s local cache.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Maximum concurrent probes while Half-Open, and the successes needed to close.
    pub fn half_open_max_probe(&self) -> usize {
        self.half_open_max_probe
    }

    pub fn strategy(&self) -> FailureStrategy {
        self.strategy
    }

    /// Time budget for each store call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Local fallback cache sizing, if local caching is enabled.
    pub fn local_cache(&self) -> Option<LocalCacheConfig> {
        self.local_cache
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("failure_threshold", self.failure_threshold > 0),
            ("recovery_timeout", !self.recovery_timeout.is_zero()),
            ("half_open_max_probe", self.half_open_max_probe > 0),
            ("call_timeout", TimeoutPolicy::new(self.call_timeout).is_some()),
            ("health_check_interval", !self.health_check_interval.is_zero()),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::NotPositive { field });
        }
        match self.local_cache {
            None if self.strategy == FailureStrategy::Degraded => {
                Err(ConfigError::DegradedWithoutLocalCache)
            }
            Some(cache) if cache.max_size == 0 => {
                Err(ConfigError::NotPositive { field: "local_cache.max_size" })
            }
            Some(cache) if cache.ttl.is_zero() => {
                Err(ConfigError::NotPositive { field: "local_cache.ttl" })
            }
            _ => Ok(()),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, n: usize) -> Self {
        self.config.failure_threshold = n;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn half_open_max_probe(mut self, n: usize) -> Self {
        self.config.half_open_max_probe = n;
        self
    }

    pub fn strategy(mut self, strategy: FailureStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Enable the local fallback cache with the given sizing.
    pub fn local_cache(mut self, max_size: usize, ttl: Duration) -> Self {
        self.config.local_cache = Some(LocalCacheConfig { max_size, ttl });
        self
    }

    /// Disable local caching. Not allowed with [`FailureStrategy::Degraded`].
    pub fn without_local_cache(mut self) -> Self {
        self.config.local_cache = None;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of the breaker for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failure_count: usize,
    pub strategy: FailureStrategy,
    /// Time until an open circuit admits a probe; `None` unless open.
    #[serde(rename = "time_until_recovery_secs", serialize_with = "serialize_secs")]
    pub time_until_recovery: Option<Duration>,
    pub local_cache_size: usize,
}

fn serialize_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    last_failure_millis: u64,
    half_open_success_count: usize,
    half_open_in_flight: usize,
    /// Bumped on every transition so probe permits from an earlier half-open phase are inert.
    generation: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.half_open_success_count = 0;
        self.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    /// Call the store; `probe` carries the half-open generation when this call is a probe.
    Store { probe: Option<u64> },
    Local,
    Bypass,
    Reject { failure_count: usize, retry_in: Option<Duration> },
}

/// Releases a half-open probe slot when the call finishes or is cancelled.
struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl ProbePermit<'_> {
    fn release(&mut self, st: &mut BreakerState) {
        if let Some(generation) = self.generation.take() {
            if st.state == CircuitState::HalfOpen && st.generation == generation {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Whether this call is a probe of the current half-open phase.
    fn is_current_probe(&self, st: &BreakerState) -> bool {
        st.state == CircuitState::HalfOpen && self.generation == Some(st.generation)
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if self.generation.is_some() {
            let breaker = self.breaker;
            let mut st = breaker.lock();
            self.release(&mut st);
        }
    }
}

/// Where a result came from.
enum Served<T> {
    Store(T),
    Fallback(T),
}

impl<T> Served<T> {
    fn into_inner(self) -> T {
        match self {
            Served::Store(v) | Served::Fallback(v) => v,
        }
    }
}

/// Circuit breaker guarding a [`BackingStore`].
///
/// Construct one per process at the composition root and share it via `Arc`. The store is
/// injected and not owned; the local fallback cache and breaker state are.
#[derive(Debug)]
pub struct CircuitBreaker {
    store: Arc<dyn BackingStore>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    local: Option<LocalFallbackCache>,
    timeout: TimeoutPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Create a closed breaker in front of `store`.
    ///
    /// # Examples
    /// ```
    /// use std::sync::Arc;
    /// use storeguard::{CircuitBreaker, CircuitBreakerConfig, InMemoryStore};
    ///
    /// let breaker = CircuitBreaker::new(
    ///     Arc::new(InMemoryStore::new()),
    ///     CircuitBreakerConfig::default(),
    /// )
    /// .unwrap();
    /// ```
    pub fn new(
        store: Arc<dyn BackingStore>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(store, config, Arc::new(SystemClock::default()), Arc::new(NullSink))
    }

    /// Create a breaker with an explicit clock and event sink.
    pub fn with_parts(
        store: Arc<dyn BackingStore>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = TimeoutPolicy::new(config.call_timeout)
            .ok_or(ConfigError::NotPositive { field: "call_timeout" })?;
        let local = config
            .local_cache
            .map(|cache| LocalFallbackCache::new(cache, clock.clone()))
            .transpose()?;
        Ok(Self {
            store,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_millis: 0,
                half_open_success_count: 0,
                half_open_in_flight: 0,
                generation: 0,
            }),
            local,
            timeout,
            clock,
            events,
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Clock used for breaker timing; shared with components layered on the breaker.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The local fallback cache, if local caching is enabled.
    pub fn local_cache(&self) -> Option<&LocalFallbackCache> {
        self.local.as_ref()
    }

    /// Snapshot for health and observability endpoints.
    pub fn status(&self) -> BreakerStatus {
        let now = self.clock.now_millis();
        let (state, failure_count, time_until_recovery) = {
            let st = self.lock();
            let until = (st.state == CircuitState::Open).then(|| self.time_until_recovery(&st, now));
            (st.state, st.failure_count, until)
        };
        BreakerStatus {
            state,
            failure_count,
            strategy: self.config.strategy,
            time_until_recovery,
            local_cache_size: self.local.as_ref().map_or(0, LocalFallbackCache::len),
        }
    }

    /// Force the circuit closed and clear failure accounting.
    pub fn reset(&self) {
        let was = {
            let mut st = self.lock();
            let was = st.state;
            st.transition(CircuitState::Closed);
            was
        };
        if was != CircuitState::Closed {
            tracing::info!(from = %was, "circuit breaker reset → closed");
            self.emit(BreakerEvent::Closed);
        }
    }

    /// Read `key`. `Ok(None)` when absent, or when the store is bypassed.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BreakerError> {
        let served = self
            .guarded("get", || self.store.get(key), |cache| cache.get(key), None)
            .await?;
        Ok(served.into_inner())
    }

    /// Write `key`. `Ok(true)` when the value was stored in the backing store or the local
    /// cache, `Ok(false)` when it was dropped under fail-open.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BreakerError> {
        let served = self
            .guarded(
                "set",
                || async move { self.store.set(key, value, ttl).await.map(|()| true) },
                |cache| {
                    cache.set(key, value.to_vec());
                    true
                },
                false,
            )
            .await?;
        if let (Served::Store(_), Some(cache)) = (&served, &self.local) {
            cache.set(key, value.to_vec());
        }
        Ok(served.into_inner())
    }

    /// Remove `key`. Returns whether it existed wherever the call was served.
    pub async fn delete(&self, key: &str) -> Result<bool, BreakerError> {
        let served = self
            .guarded("delete", || self.store.delete(key), |cache| cache.delete(key), false)
            .await?;
        if let (Served::Store(_), Some(cache)) = (&served, &self.local) {
            cache.delete(key);
        }
        Ok(served.into_inner())
    }

    /// One health-check round.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open without touching
    /// the store; an open circuit still cooling down is left alone. Otherwise the store is
    /// pinged: success while half-open counts as a probe success, failure is recorded exactly
    /// like a request failure.
    pub async fn health_check_once(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let (should_ping, event) = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Open if self.recovery_elapsed(&st, now) => {
                    st.transition(CircuitState::HalfOpen);
                    (false, Some(BreakerEvent::HalfOpen))
                }
                CircuitState::Open => (false, None),
                _ => (true, None),
            }
        };
        if let Some(event) = event {
            tracing::info!("circuit breaker → half-open (health check)");
            self.emit(event);
        }
        if should_ping {
            let mut permit = ProbePermit { breaker: self, generation: None };
            match self.timeout.execute(self.store.ping()).await {
                Ok(()) => self.on_success(&mut permit, true),
                Err(err) => self.on_failure("ping", &err, &mut permit),
            }
        }
        self.state()
    }

    /// Run [`health_check_once`](Self::health_check_once) every `health_check_interval` until
    /// the returned task is shut down or dropped.
    pub fn spawn_health_check(self: &Arc<Self>) -> BackgroundTask {
        let breaker = Arc::clone(self);
        let interval = self.config.health_check_interval;
        BackgroundTask::spawn("circuit_breaker_health_check", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let state = breaker.health_check_once().await;
                        tracing::trace!(state = %state, "health check round complete");
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn guarded<T, F, Fut>(
        &self,
        op: &'static str,
        call: F,
        local: impl FnOnce(&LocalFallbackCache) -> T,
        bypass: T,
    ) -> Result<Served<T>, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.admit() {
            Admission::Store { probe } => {
                let mut permit = ProbePermit { breaker: self, generation: probe };
                match self.timeout.execute(call()).await {
                    Ok(value) => {
                        self.on_success(&mut permit, false);
                        Ok(Served::Store(value))
                    }
                    Err(err) => {
                        self.on_failure(op, &err, &mut permit);
                        drop(permit);
                        match self.config.strategy {
                            FailureStrategy::Degraded => {
                                Ok(Served::Fallback(self.serve_locally(op, local, bypass)))
                            }
                            FailureStrategy::FailClosed => Err(BreakerError::StoreUnavailable(err)),
                            FailureStrategy::FailOpen => {
                                self.emit(BreakerEvent::Bypassed { op });
                                Ok(Served::Fallback(bypass))
                            }
                        }
                    }
                }
            }
            Admission::Local => Ok(Served::Fallback(self.serve_locally(op, local, bypass))),
            Admission::Bypass => {
                tracing::debug!(op, "circuit open: bypassing store (fail-open)");
                self.emit(BreakerEvent::Bypassed { op });
                Ok(Served::Fallback(bypass))
            }
            Admission::Reject { failure_count, retry_in } => {
                tracing::debug!(op, ?retry_in, "circuit open: rejecting (fail-closed)");
                self.emit(BreakerEvent::Rejected { op });
                Err(BreakerError::CircuitOpen { failure_count, retry_in })
            }
        }
    }

    fn serve_locally<T>(
        &self,
        op: &'static str,
        local: impl FnOnce(&LocalFallbackCache) -> T,
        bypass: T,
    ) -> T {
        match &self.local {
            Some(cache) => {
                self.emit(BreakerEvent::ServedLocally { op });
                local(cache)
            }
            None => {
                self.emit(BreakerEvent::Bypassed { op });
                bypass
            }
        }
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now_millis();
        let (admission, half_opened) = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed => (Admission::Store { probe: None }, false),
                CircuitState::Open if self.recovery_elapsed(&st, now) => {
                    st.transition(CircuitState::HalfOpen);
                    st.half_open_in_flight = 1;
                    (Admission::Store { probe: Some(st.generation) }, true)
                }
                CircuitState::HalfOpen
                    if st.half_open_success_count + st.half_open_in_flight
                        < self.config.half_open_max_probe =>
                {
                    st.half_open_in_flight += 1;
                    tracing::debug!(
                        in_flight = st.half_open_in_flight,
                        max = self.config.half_open_max_probe,
                        "circuit breaker: half-open probe"
                    );
                    (Admission::Store { probe: Some(st.generation) }, false)
                }
                _ => (self.degrade(&st, now), false),
            }
        };
        if half_opened {
            tracing::info!("circuit breaker → half-open");
            self.emit(BreakerEvent::HalfOpen);
        }
        admission
    }

    fn degrade(&self, st: &BreakerState, now: u64) -> Admission {
        match self.config.strategy {
            FailureStrategy::FailOpen => Admission::Bypass,
            FailureStrategy::FailClosed => Admission::Reject {
                failure_count: st.failure_count,
                // Saturated half-open waits on probes, not on the recovery timeout.
                retry_in: (st.state == CircuitState::Open)
                    .then(|| self.time_until_recovery(st, now)),
            },
            FailureStrategy::Degraded => Admission::Local,
        }
    }

    fn on_success(&self, permit: &mut ProbePermit<'_>, health_check: bool) {
        let closed = {
            let mut st = self.lock();
            let counts = st.state == CircuitState::HalfOpen
                && (health_check || permit.is_current_probe(&st));
            permit.release(&mut st);
            if counts {
                st.half_open_success_count += 1;
                if st.half_open_success_count >= self.config.half_open_max_probe {
                    st.transition(CircuitState::Closed);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if closed {
            tracing::info!("circuit breaker → closed");
            self.emit(BreakerEvent::Closed);
        }
    }

    fn on_failure(&self, op: &'static str, err: &StoreError, permit: &mut ProbePermit<'_>) {
        let now = self.clock.now_millis();
        let (failures, opened) = {
            let mut st = self.lock();
            permit.release(&mut st);
            st.failure_count += 1;
            st.last_failure_millis = now;
            let opened = st.state != CircuitState::Open
                && st.failure_count >= self.config.failure_threshold;
            if opened {
                let failures = st.failure_count;
                st.transition(CircuitState::Open);
                st.failure_count = failures;
            }
            (st.failure_count, opened)
        };
        tracing::warn!(op, failures, error = %err, "backing store call failed");
        self.emit(BreakerEvent::StoreFailed { op, timeout: err.is_timeout() });
        if opened {
            tracing::error!(
                failures,
                threshold = self.config.failure_threshold,
                "circuit breaker → open"
            );
            self.emit(BreakerEvent::Opened { failure_count: failures });
        }
    }

    fn recovery_elapsed(&self, st: &BreakerState, now: u64) -> bool {
        Duration::from_millis(now.saturating_sub(st.last_failure_millis))
            > self.config.recovery_timeout
    }

    fn time_until_recovery(&self, st: &BreakerState, now: u64) -> Duration {
        let elapsed = Duration::from_millis(now.saturating_sub(st.last_failure_millis));
        self.config.recovery_timeout.saturating_sub(elapsed)
    }

    fn emit(&self, event: BreakerEvent) {
        self.events.emit(GuardEvent::Breaker(event));
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
