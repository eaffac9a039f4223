#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # storeguard
//!
//! Keeps request handling alive while a shared key-value store degrades, and enforces
//! per-client, per-route request limits on top of it.
//!
//! ## Features
//!
//! - **Circuit breaker** mediating every backing store call, with half-open probing bounded by
//!   `half_open_max_probe` and a periodic health check
//! - **Failure strategies**: fail open, fail closed, or degrade to a local LRU cache with TTL
//! - **Token-bucket rate limiter** with per-route rules, IP and user scopes, and combined limits
//! - **Hot reload** of limiter configuration through atomic snapshot swaps
//! - **Tower middleware** that separates "slow down" (429) from "backend degraded" (503)
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use storeguard::{
//!     CircuitBreaker, CircuitBreakerConfig, InMemoryStore, LimiterSettings, RateLimiter,
//!     StaticConfigProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = Arc::new(
//!         CircuitBreaker::new(Arc::new(InMemoryStore::new()), CircuitBreakerConfig::default())
//!             .unwrap(),
//!     );
//!     let settings = LimiterSettings::default().with_rule("/login", 5, 2);
//!     let limiter =
//!         RateLimiter::from_provider(breaker, Arc::new(StaticConfigProvider::new(settings)))
//!             .await
//!             .unwrap();
//!
//!     let decision = limiter.check("/login", "203.0.113.7", None).await.unwrap();
//!     assert!(decision.allowed);
//!     assert_eq!(decision.remaining, 6);
//! }
//! ```

pub mod adaptive;
pub mod bucket;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod runtime;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use bucket::TokenBucket;
pub use cache::{LocalCacheConfig, LocalFallbackCache};
pub use circuit_breaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitState, FailureStrategy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigProvider, JsonFileConfigProvider, LimiterConfig, LimiterSettings, RuleSettings,
    StaticConfigProvider,
};
pub use error::{BreakerError, ConfigError, DecodeError, LimiterError, StoreError};
pub use rate_limit::{
    RateLimitDecision, RateLimitError, RateLimitLayer, RateLimitRule, RateLimitService,
    RateLimiter, RequestIdentity, RuleSet, Scope,
};
pub use runtime::GuardRuntime;
pub use store::{BackingStore, InMemoryStore};
pub use task::BackgroundTask;
pub use timeout::TimeoutPolicy;
