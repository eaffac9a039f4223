//! Token-bucket rate limiter persisted through the circuit breaker.

use super::rules::ResolvedRule;
use super::{RateLimitDecision, Scope};
use crate::adaptive::DynamicConfig;
use crate::bucket::TokenBucket;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::{ConfigProvider, LimiterConfig};
use crate::error::{ConfigError, LimiterError};
use crate::task::BackgroundTask;
use crate::telemetry::{ConfigEvent, EventSink, GuardEvent, LimiterEvent, NullSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table size below which dead entries are not pruned.
const MIN_PRUNE_AT: usize = 1_024;

/// Per-key locks serializing a bucket's read, consume, and write-back within this process.
///
/// The table holds weak references: a key's lock lives only while some check holds or waits
/// on it, and dead entries are pruned whenever the table doubles.
#[derive(Debug)]
struct BucketLocks {
    table: Mutex<LockTable>,
}

#[derive(Debug)]
struct LockTable {
    slots: HashMap<String, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

impl BucketLocks {
    fn new() -> Self {
        Self {
            table: Mutex::new(LockTable { slots: HashMap::new(), prune_at: MIN_PRUNE_AT }),
        }
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.slots.get(key).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    if table.slots.len() >= table.prune_at {
                        table.slots.retain(|_, slot| slot.strong_count() > 0);
                        table.prune_at = (table.slots.len() * 2).max(MIN_PRUNE_AT);
                    }
                    let slot = Arc::new(AsyncMutex::new(()));
                    table.slots.insert(key.to_string(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }
}

/// Result of consuming from one scoped bucket.
#[derive(Debug)]
struct ScopeOutcome {
    scope: Scope,
    allowed: bool,
    remaining: u32,
    reset_epoch_seconds: u64,
}

/// Rate limiter over breaker-protected bucket storage.
///
/// Every [`check`](Self::check) reads the configuration snapshot once, so a concurrent
/// [`reload`](Self::reload) is either fully visible to a request or not at all. Within one
/// process, updates to the same bucket are serialized; across processes sharing a store they
/// are plain read-modify-write, so instances may together admit more than the limit.
#[derive(Debug)]
pub struct RateLimiter {
    breaker: Arc<CircuitBreaker>,
    config: DynamicConfig<LimiterConfig>,
    provider: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    locks: BucketLocks,
}

impl RateLimiter {
    /// Create a limiter with an already validated snapshot. `provider` feeds later reloads.
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        config: LimiterConfig,
        provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        let clock = Arc::clone(breaker.clock());
        Self {
            breaker,
            config: DynamicConfig::new(config),
            provider,
            clock,
            events: Arc::new(NullSink),
            locks: BucketLocks::new(),
        }
    }

    /// Load the initial snapshot from `provider`, failing fast on invalid configuration.
    pub async fn from_provider(
        breaker: Arc<CircuitBreaker>,
        provider: Arc<dyn ConfigProvider>,
    ) -> Result<Self, ConfigError> {
        let config = provider.load_config().await?;
        Ok(Self::new(breaker, config, provider))
    }

    /// Emit limiter and config events into `events`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The active configuration snapshot.
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.get()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Decide whether one request may proceed, consuming a token from every candidate scope.
    ///
    /// With `combine_limits` every scope must allow the request; otherwise the primary scope
    /// alone decides and the other bucket is only charged, so enabling combined limits later
    /// starts from accurate counts.
    ///
    /// Fails with [`LimiterError::Unavailable`] when bucket state cannot be read or written
    /// through the breaker; the limiter never guesses allow or deny on its own.
    pub async fn check(
        &self,
        path: &str,
        client_ip: &str,
        user_id: Option<&str>,
    ) -> Result<RateLimitDecision, LimiterError> {
        let config = self.config.get();
        let resolved = config.rules().resolve(path);
        let (primary, secondary) = candidate_scopes(&config, client_ip, user_id);
        let now = self.clock.epoch_seconds();

        let mut deciding = self.consume_reporting(path, &config, resolved, primary, now).await?;
        if let Some(scope) = secondary {
            let outcome = self.consume_reporting(path, &config, resolved, scope, now).await?;
            // Denying scopes first, then the one with the fewest tokens left.
            if config.combine_limits()
                && (outcome.allowed, outcome.remaining) < (deciding.allowed, deciding.remaining)
            {
                deciding = outcome;
            }
        }
        let allowed = deciding.allowed;
        let decision = RateLimitDecision {
            allowed,
            limit: resolved.rule.limit(),
            burst: resolved.rule.burst(),
            remaining: deciding.remaining,
            reset_epoch_seconds: deciding.reset_epoch_seconds,
            scope: deciding.scope,
            rule: resolved.scope.to_string(),
            decided_at: now,
        };

        let scope = deciding.scope.to_string();
        if allowed {
            tracing::trace!(path, rule = resolved.scope, scope = %scope, remaining = decision.remaining, "request allowed");
            self.events.emit(GuardEvent::Limiter(LimiterEvent::Allowed {
                scope,
                remaining: decision.remaining,
            }));
        } else {
            let retry_after_secs = decision.retry_after_secs(now);
            tracing::debug!(path, rule = resolved.scope, scope = %scope, retry_after_secs, "request rate limited");
            self.events.emit(GuardEvent::Limiter(LimiterEvent::Denied { scope, retry_after_secs }));
        }
        Ok(decision)
    }

    /// Store key of the bucket `check` uses for `path` under `scope` for client `id`.
    pub fn bucket_key(&self, path: &str, scope: Scope, id: &str) -> String {
        let config = self.config.get();
        let resolved = config.rules().resolve(path);
        bucket_key(&config, resolved, scope, id)
    }

    /// Forget a client's bucket for the rule covering `path`. Returns whether one existed.
    pub async fn reset_key(&self, path: &str, scope: Scope, id: &str) -> Result<bool, LimiterError> {
        let key = self.bucket_key(path, scope, id);
        let existed = self.breaker.delete(&key).await?;
        tracing::info!(key = %key, existed, "rate limit bucket reset");
        Ok(existed)
    }

    /// Fetch, validate, and atomically install a new snapshot from the provider.
    ///
    /// On error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<LimiterConfig>, ConfigError> {
        match self.provider.load_config().await {
            Ok(config) => {
                let rules = config.rules().len();
                self.config.swap(config);
                tracing::info!(rules, "rate limiter configuration reloaded");
                self.events.emit(GuardEvent::Config(ConfigEvent::Reloaded { rules }));
                Ok(self.config.get())
            }
            Err(err) => {
                tracing::warn!(error = %err, "rejected rate limiter configuration; keeping previous snapshot");
                self.events.emit(GuardEvent::Config(ConfigEvent::Rejected { reason: err.to_string() }));
                Err(err)
            }
        }
    }

    /// Reload on the snapshot's `hot_reload_interval` until the task is shut down.
    ///
    /// Returns `None` when hot reload is disabled. The period is re-read after every reload;
    /// a reload that disables hot reload keeps the last period.
    pub fn spawn_hot_reload(self: &Arc<Self>) -> Option<BackgroundTask> {
        let mut period = self.config.get().hot_reload_interval()?;
        let limiter = Arc::clone(self);
        Some(BackgroundTask::spawn("rate_limit_hot_reload", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if let Ok(config) = limiter.reload().await {
                            period = config.hot_reload_interval().unwrap_or(period);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }

    async fn consume_reporting(
        &self,
        path: &str,
        config: &LimiterConfig,
        resolved: ResolvedRule<'_>,
        (scope, id): (Scope, &str),
        now: f64,
    ) -> Result<ScopeOutcome, LimiterError> {
        let result = self.consume(config, resolved, scope, id, now).await;
        if let Err(err) = &result {
            tracing::warn!(path, scope = %scope, error = %err, "rate limiter unavailable");
            self.events.emit(GuardEvent::Limiter(LimiterEvent::Unavailable));
        }
        result
    }

    async fn consume(
        &self,
        config: &LimiterConfig,
        resolved: ResolvedRule<'_>,
        scope: Scope,
        id: &str,
        now: f64,
    ) -> Result<ScopeOutcome, LimiterError> {
        let key = bucket_key(config, resolved, scope, id);
        let rule = resolved.rule;
        let _guard = self.locks.lock(&key).await;
        let mut bucket = match self.breaker.get(&key).await? {
            Some(bytes) => match TokenBucket::from_bytes(&bytes) {
                Ok(mut bucket) => {
                    if !rule.shapes(&bucket) {
                        bucket.reshape(rule.capacity(), rule.refill_rate());
                    }
                    bucket
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "discarding undecodable bucket");
                    rule.bucket(now)
                }
            },
            None => rule.bucket(now),
        };

        let allowed = bucket.consume(1.0, now);
        self.breaker.set(&key, &bucket.to_bytes(), Some(config.bucket_ttl())).await?;

        let until_full = bucket.seconds_until_full().unwrap_or(0.0);
        Ok(ScopeOutcome {
            scope,
            allowed,
            remaining: bucket.remaining(),
            reset_epoch_seconds: (now + until_full).ceil() as u64,
        })
    }
}

fn bucket_key(config: &LimiterConfig, resolved: ResolvedRule<'_>, scope: Scope, id: &str) -> String {
    format!("{}:{}:{}:{}", config.key_prefix(), scope, resolved.scope, id)
}

/// Scopes charged for a request: the primary scope, plus the user scope when both are enabled
/// and a user id is present.
///
/// IP is primary unless user scoping is the only one enabled and a user id is present, so a
/// user-only configuration falls back to IP for anonymous requests.
fn candidate_scopes<'a>(
    config: &LimiterConfig,
    client_ip: &'a str,
    user_id: Option<&'a str>,
) -> ((Scope, &'a str), Option<(Scope, &'a str)>) {
    let ip = (Scope::Ip, client_ip);
    let user = user_id.filter(|_| config.use_user_based()).map(|id| (Scope::User, id));
    match (config.use_ip_based(), user) {
        (true, user) => (ip, user),
        (false, Some(user)) => (user, None),
        (false, None) => (ip, None),
    }
}
