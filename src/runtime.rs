//! Composition root: one breaker, one limiter, and their background tasks.

use crate::circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
use crate::config::ConfigProvider;
use crate::error::ConfigError;
use crate::rate_limit::RateLimiter;
use crate::store::BackingStore;
use crate::task::BackgroundTask;
use crate::telemetry::{EventSink, LogSink};
use std::sync::Arc;

/// Owns the process-wide [`CircuitBreaker`] and [`RateLimiter`] and the tasks that keep them
/// healthy.
///
/// Dropping the runtime signals both tasks to stop; [`shutdown`](Self::shutdown) also waits for
/// them.
///
/// ```no_run
/// use std::sync::Arc;
/// use storeguard::{
///     CircuitBreakerConfig, GuardRuntime, InMemoryStore, LimiterSettings, StaticConfigProvider,
/// };
///
/// # async fn run() -> Result<(), storeguard::ConfigError> {
/// let runtime = GuardRuntime::start(
///     Arc::new(InMemoryStore::new()),
///     CircuitBreakerConfig::default(),
///     Arc::new(StaticConfigProvider::new(LimiterSettings::default().with_rule("/login", 5, 2))),
/// )
/// .await?;
///
/// let decision = runtime.limiter().check("/login", "203.0.113.7", None).await;
/// assert!(decision.map(|d| d.allowed).unwrap_or(false));
/// runtime.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GuardRuntime {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    tasks: Vec<BackgroundTask>,
}

impl GuardRuntime {
    /// Validate configuration, build the breaker and limiter, and spawn the health-check and
    /// hot-reload loops. Events are logged through `tracing`.
    pub async fn start(
        store: Arc<dyn BackingStore>,
        breaker_config: CircuitBreakerConfig,
        provider: Arc<dyn ConfigProvider>,
    ) -> Result<Self, ConfigError> {
        Self::start_with_sink(store, breaker_config, provider, Arc::new(LogSink)).await
    }

    /// Like [`start`](Self::start), with an explicit event sink for both components.
    pub async fn start_with_sink(
        store: Arc<dyn BackingStore>,
        breaker_config: CircuitBreakerConfig,
        provider: Arc<dyn ConfigProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        let breaker = CircuitBreaker::with_parts(
            store,
            breaker_config,
            Arc::new(crate::clock::SystemClock::default()),
            events.clone(),
        )?;
        Self::assemble(Arc::new(breaker), provider, events).await
    }

    /// Assemble around an existing breaker, for callers that need a custom clock.
    pub async fn assemble(
        breaker: Arc<CircuitBreaker>,
        provider: Arc<dyn ConfigProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        let limiter = Arc::new(
            RateLimiter::from_provider(Arc::clone(&breaker), provider)
                .await?
                .with_event_sink(events),
        );

        let mut tasks = vec![breaker.spawn_health_check()];
        tasks.extend(limiter.spawn_hot_reload());
        tracing::info!(
            strategy = %breaker.config().strategy(),
            hot_reload = tasks.len() > 1,
            "store guard runtime started"
        );
        Ok(Self { breaker, limiter, tasks })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Breaker status for health endpoints.
    pub fn status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    /// Names of the running background tasks.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(BackgroundTask::name).collect()
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(self) {
        futures::future::join_all(self.tasks.into_iter().map(BackgroundTask::shutdown)).await;
        tracing::info!("store guard runtime stopped");
    }
}
