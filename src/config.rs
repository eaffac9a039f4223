//! Rate limiter configuration: raw settings, validated snapshots, and providers.
//!
//! [`LimiterSettings`] is the serde form a [`ConfigProvider`] returns. It compiles into an
//! immutable [`LimiterConfig`] or is rejected whole with a [`ConfigError`]; a rejected document
//! never replaces the active snapshot.
//!
//! ```json
//! {
//!   "default_limit": 60,
//!   "default_burst": 10,
//!   "endpoint_rules": { "/login": { "limit": 5, "burst": 2 }, "/api/*": { "limit": 600 } },
//!   "use_ip_based": true,
//!   "use_user_based": true,
//!   "combine_limits": true,
//!   "hot_reload_interval_secs": 30
//! }
//! ```

use crate::error::ConfigError;
use crate::rate_limit::rules::{RateLimitRule, RuleSet, DEFAULT_SCOPE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Raw rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    pub limit: i64,
    #[serde(default)]
    pub burst: i64,
}

/// Raw limiter settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSettings {
    /// Requests per minute for paths without a matching rule.
    pub default_limit: i64,
    pub default_burst: i64,
    /// Route pattern to rule. Patterns are absolute paths, optionally ending in `*`.
    pub endpoint_rules: BTreeMap<String, RuleSettings>,
    pub use_ip_based: bool,
    pub use_user_based: bool,
    /// Deny unless every evaluated scope allows.
    pub combine_limits: bool,
    /// Seconds between reloads; 0 disables hot reload.
    #[serde(alias = "hot_reload_interval")]
    pub hot_reload_interval_secs: u64,
    /// Expiry applied to persisted buckets so idle ones are collected.
    pub bucket_ttl_secs: u64,
    /// Namespace for bucket keys in the backing store.
    pub key_prefix: String,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_limit: 60,
            default_burst: 10,
            endpoint_rules: BTreeMap::new(),
            use_ip_based: true,
            use_user_based: false,
            combine_limits: false,
            hot_reload_interval_secs: 0,
            bucket_ttl_secs: 3_600,
            key_prefix: "ratelimit".to_string(),
        }
    }
}

impl LimiterSettings {
    /// Parse a JSON document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Add or replace an endpoint rule.
    pub fn with_rule(mut self, pattern: impl Into<String>, limit: i64, burst: i64) -> Self {
        self.endpoint_rules.insert(pattern.into(), RuleSettings { limit, burst });
        self
    }

    /// Validate and build an immutable snapshot.
    pub fn compile(&self) -> Result<LimiterConfig, ConfigError> {
        if !self.use_ip_based && !self.use_user_based {
            return Err(ConfigError::NoScopeEnabled);
        }
        if self.bucket_ttl_secs == 0 {
            return Err(ConfigError::NotPositive { field: "bucket_ttl_secs" });
        }
        let prefix = self.key_prefix.as_str();
        if prefix.is_empty() || prefix.contains(':') || prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidKeyPrefix);
        }

        let default = RateLimitRule::new(DEFAULT_SCOPE, self.default_limit, self.default_burst)?;
        let mut rules = RuleSet::new(default);
        for (pattern, raw) in &self.endpoint_rules {
            rules.insert(pattern, RateLimitRule::new(pattern, raw.limit, raw.burst)?)?;
        }

        Ok(LimiterConfig {
            rules,
            use_ip_based: self.use_ip_based,
            use_user_based: self.use_user_based,
            combine_limits: self.combine_limits,
            hot_reload_interval: (self.hot_reload_interval_secs > 0)
                .then(|| Duration::from_secs(self.hot_reload_interval_secs)),
            bucket_ttl: Duration::from_secs(self.bucket_ttl_secs),
            key_prefix: self.key_prefix.clone(),
        })
    }
}

/// Validated, immutable limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    rules: RuleSet,
    use_ip_based: bool,
    use_user_based: bool,
    combine_limits: bool,
    hot_reload_interval: Option<Duration>,
    bucket_ttl: Duration,
    key_prefix: String,
}

impl LimiterConfig {
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn use_ip_based(&self) -> bool {
        self.use_ip_based
    }

    pub fn use_user_based(&self) -> bool {
        self.use_user_based
    }

    pub fn combine_limits(&self) -> bool {
        self.combine_limits
    }

    /// Reload cadence, `None` when hot reload is disabled.
    pub fn hot_reload_interval(&self) -> Option<Duration> {
        self.hot_reload_interval
    }

    pub fn bucket_ttl(&self) -> Duration {
        self.bucket_ttl
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

/// Source of limiter settings, polled at startup and on every hot-reload tick.
#[async_trait]
pub trait ConfigProvider: Send + Sync + std::fmt::Debug {
    /// Fetch the current raw settings.
    async fn load(&self) -> Result<LimiterSettings, ConfigError>;

    /// Fetch and validate.
    async fn load_config(&self) -> Result<LimiterConfig, ConfigError> {
        self.load().await?.compile()
    }
}

/// In-memory provider. Clones share the value, so a test or an admin endpoint can keep a
/// handle and [`update`](Self::update) what the next reload sees.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    settings: Arc<Mutex<LimiterSettings>>,
}

impl StaticConfigProvider {
    pub fn new(settings: LimiterSettings) -> Self {
        Self { settings: Arc::new(Mutex::new(settings)) }
    }

    /// Replace the settings returned by subsequent loads. Not validated here.
    pub fn update(&self, settings: LimiterSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn load(&self) -> Result<LimiterSettings, ConfigError> {
        Ok(self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Reads settings from a JSON file on every load.
#[derive(Debug, Clone)]
pub struct JsonFileConfigProvider {
    path: PathBuf,
}

impl JsonFileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigProvider for JsonFileConfigProvider {
    async fn load(&self) -> Result<LimiterSettings, ConfigError> {
        let bytes = tokio::fs::read(&self.path).await?;
        LimiterSettings::from_json(&bytes)
    }
}
