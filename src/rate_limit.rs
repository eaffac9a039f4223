//! Per-route, per-client rate limiting.
//!
//! - [`RateLimiter`]: resolves the route rule, consumes from scoped token buckets persisted
//!   through the circuit breaker, and returns a [`RateLimitDecision`].
//! - [`RuleSet`]: exact, wildcard-prefix, and default rule resolution.
//! - [`RateLimitLayer`]: tower middleware that turns decisions into 429 / 503 rejections.
//!
//! # Keys
//!
//! Buckets are stored under `"{key_prefix}:{scope}:{rule_scope}:{id}"`, for example
//! `ratelimit:ip:/login:203.0.113.7` or `ratelimit:user:default:alice`. A client therefore has
//! one bucket per rule, shared by every path that rule covers.

use serde::Serialize;
use std::fmt;

pub mod limiter;
pub mod middleware;
pub mod rules;

pub use limiter::RateLimiter;
pub use middleware::{RateLimitError, RateLimitLayer, RateLimitService};
pub use rules::{RateLimitRule, ResolvedRule, RuleSet};

/// Which client identity a bucket is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Ip,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the request-handling layer knows about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub path: String,
    pub client_ip: String,
    pub user_id: Option<String>,
}

impl RequestIdentity {
    pub fn new(path: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self { path: path.into(), client_ip: client_ip.into(), user_id: None }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests per minute of the deciding rule.
    pub limit: u32,
    pub burst: u32,
    /// Whole tokens left in the deciding bucket.
    pub remaining: u32,
    /// Epoch second at which the deciding bucket is full again.
    pub reset_epoch_seconds: u64,
    /// Identity scope of the deciding bucket.
    pub scope: Scope,
    /// Pattern of the deciding rule, or `"default"`.
    pub rule: String,
    #[serde(skip)]
    pub(crate) decided_at: f64,
}

impl RateLimitDecision {
    /// Seconds a denied client should wait: `max(1, reset - now)`.
    pub fn retry_after_secs(&self, now: f64) -> u64 {
        let wait = (self.reset_epoch_seconds as f64 - now).ceil();
        if wait.is_finite() && wait > 1.0 {
            wait as u64
        } else {
            1
        }
    }

    /// Standard rate limit response headers. `Retry-After` is included only on denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_epoch_seconds.to_string()),
            ("X-RateLimit-Burst", self.burst.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs(self.decided_at).to_string()));
        }
        headers
    }
}
