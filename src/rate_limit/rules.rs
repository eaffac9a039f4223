//! Route rules and path resolution.

use crate::bucket::TokenBucket;
use crate::error::ConfigError;
use std::collections::HashMap;

/// Scope label of the fallback rule.
pub const DEFAULT_SCOPE: &str = "default";

/// Per-route limit: `limit` requests per minute plus `burst` extra tokens of headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    limit: u32,
    burst: u32,
}

impl RateLimitRule {
    /// Validate a raw rule. `pattern` only labels the error.
    pub fn new(pattern: &str, limit: i64, burst: i64) -> Result<Self, ConfigError> {
        let limit = u32::try_from(limit)
            .ok()
            .filter(|l| *l >= 1)
            .ok_or_else(|| ConfigError::InvalidLimit { pattern: pattern.to_string(), limit })?;
        let burst = u32::try_from(burst)
            .map_err(|_| ConfigError::InvalidBurst { pattern: pattern.to_string(), burst })?;
        Ok(Self { limit, burst })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Bucket capacity: `limit + burst`.
    pub fn capacity(&self) -> f64 {
        f64::from(self.limit) + f64::from(self.burst)
    }

    /// Tokens per second: `limit / 60`.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.limit) / 60.0
    }

    /// A full bucket for this rule.
    pub fn bucket(&self, now: f64) -> TokenBucket {
        TokenBucket::for_rule(self.limit, self.burst, now)
    }

    /// Whether `bucket` was shaped by this rule.
    pub(crate) fn shapes(&self, bucket: &TokenBucket) -> bool {
        bucket.capacity() == self.capacity() && bucket.refill_rate() == self.refill_rate()
    }
}

/// Outcome of [`RuleSet::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule<'a> {
    pub rule: RateLimitRule,
    /// The matching pattern, or [`DEFAULT_SCOPE`].
    pub scope: &'a str,
}

#[derive(Debug, Clone)]
struct PrefixRule {
    prefix: String,
    pattern: String,
    rule: RateLimitRule,
}

/// Compiled endpoint rules.
///
/// Lookup order: exact pattern, then the longest wildcard prefix, then the default rule.
#[derive(Debug, Clone)]
pub struct RuleSet {
    exact: HashMap<String, RateLimitRule>,
    /// Sorted longest prefix first.
    prefixes: Vec<PrefixRule>,
    default: RateLimitRule,
}

impl RuleSet {
    pub fn new(default: RateLimitRule) -> Self {
        Self { exact: HashMap::new(), prefixes: Vec::new(), default }
    }

    /// Add a rule for `pattern`: an absolute path, optionally ending in a single `*`.
    pub fn insert(&mut self, pattern: &str, rule: RateLimitRule) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::InvalidPattern { pattern: pattern.to_string(), reason };
        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        match pattern.find('*') {
            None => {
                self.exact.insert(pattern.to_string(), rule);
            }
            Some(idx) if idx == pattern.len() - 1 => {
                let prefix = pattern[..idx].to_string();
                self.prefixes.retain(|p| p.prefix != prefix);
                self.prefixes.push(PrefixRule { prefix, pattern: pattern.to_string(), rule });
                self.prefixes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
            }
            Some(_) => return Err(invalid("'*' is only allowed as the final character")),
        }
        Ok(())
    }

    /// Find the rule governing `path`.
    pub fn resolve(&self, path: &str) -> ResolvedRule<'_> {
        if let Some((pattern, rule)) = self.exact.get_key_value(path) {
            return ResolvedRule { rule: *rule, scope: pattern };
        }
        self.prefixes
            .iter()
            .find(|p| path.starts_with(&p.prefix))
            .map(|p| ResolvedRule { rule: p.rule, scope: &p.pattern })
            .unwrap_or(ResolvedRule { rule: self.default, scope: DEFAULT_SCOPE })
    }

    pub fn default_rule(&self) -> RateLimitRule {
        self.default
    }

    /// Number of endpoint rules, excluding the default.
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(limit: i64) -> RateLimitRule {
        RateLimitRule::new("/t", limit, 0).unwrap()
    }

    fn rules() -> RuleSet {
        let mut set = RuleSet::new(rule(60));
        set.insert("/login", rule(5)).unwrap();
        set.insert("/api/*", rule(100)).unwrap();
        set.insert("/api/admin/*", rule(10)).unwrap();
        set.insert("/api/admin/health", rule(1000)).unwrap();
        set
    }

    #[test]
    fn exact_beats_prefix_beats_default() {
        let set = rules();
        assert_eq!(set.resolve("/login").scope, "/login");
        assert_eq!(set.resolve("/login").rule.limit(), 5);
        assert_eq!(set.resolve("/api/admin/health").scope, "/api/admin/health");
        assert_eq!(set.resolve("/api/admin/users").scope, "/api/admin/*");
        assert_eq!(set.resolve("/api/users").scope, "/api/*");
        assert_eq!(set.resolve("/api/").scope, "/api/*");
        assert_eq!(set.resolve("/api").scope, DEFAULT_SCOPE);
        assert_eq!(set.resolve("/login/extra").rule.limit(), 60);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn rule_validation() {
        assert!(matches!(
            RateLimitRule::new("/x", 0, 0),
            Err(ConfigError::InvalidLimit { limit: 0, .. })
        ));
        assert!(matches!(
            RateLimitRule::new("/x", -5, 0),
            Err(ConfigError::InvalidLimit { limit: -5, .. })
        ));
        assert!(matches!(
            RateLimitRule::new("/x", 5, -1),
            Err(ConfigError::InvalidBurst { burst: -1, .. })
        ));

        let r = RateLimitRule::new("/login", 5, 2).unwrap();
        assert_eq!(r.capacity(), 7.0);
        assert!(r.shapes(&r.bucket(0.0)));
        assert!(!rule(6).shapes(&r.bucket(0.0)));
    }

    #[test]
    fn pattern_validation() {
        let mut set = RuleSet::new(rule(1));
        assert!(matches!(
            set.insert("login", rule(1)),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(
            set.insert("/a/*/b", rule(1)),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(set.insert("/a/**", rule(1)), Err(ConfigError::InvalidPattern { .. })));
        assert!(set.insert("/*", rule(2)).is_ok());
        assert_eq!(set.resolve("/anything").scope, "/*");
    }
}
