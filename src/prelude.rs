//! Convenient re-exports for wiring storeguard into a service.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureStrategy},
    config::{ConfigProvider, LimiterSettings, StaticConfigProvider},
    error::{BreakerError, ConfigError, LimiterError, StoreError},
    rate_limit::{RateLimitDecision, RateLimitError, RateLimitLayer, RateLimiter, RequestIdentity},
    runtime::GuardRuntime,
    store::BackingStore,
};
