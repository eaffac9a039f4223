mod common;

use common::test_helpers::fixture;
use futures::future::join_all;
use std::time::Duration;
use storeguard::{CircuitBreakerConfig, Clock, LimiterSettings, Scope, TokenBucket};

fn login_rule() -> LimiterSettings {
    LimiterSettings::default().with_rule("/login", 5, 2)
}

#[tokio::test]
async fn login_allows_capacity_then_denies() {
    let f = fixture(CircuitBreakerConfig::default(), login_rule()).await;

    let mut remaining = Vec::new();
    for _ in 0..7 {
        let d = f.limiter.check("/login", "198.51.100.4", None).await.unwrap();
        assert!(d.allowed);
        assert_eq!((d.limit, d.burst), (5, 2));
        remaining.push(d.remaining);
    }
    assert_eq!(remaining, vec![6, 5, 4, 3, 2, 1, 0]);

    let denied = f.limiter.check("/login", "198.51.100.4", None).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    let now = f.clock.epoch_seconds();
    assert!(denied.retry_after_secs(now) >= 1);
    assert!(denied.reset_epoch_seconds as f64 > now);

    let headers = denied.headers();
    let retry_after = headers
        .iter()
        .find(|(name, _)| *name == "Retry-After")
        .map(|(_, v)| v.parse::<u64>().unwrap())
        .expect("denial carries Retry-After");
    assert!(retry_after >= 1);
    for name in ["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset", "X-RateLimit-Burst"] {
        assert!(headers.iter().any(|(n, _)| *n == name), "missing {name}");
    }
}

#[tokio::test]
async fn clients_are_limited_independently() {
    let f = fixture(CircuitBreakerConfig::default(), login_rule()).await;
    for _ in 0..7 {
        f.limiter.check("/login", "10.0.0.1", None).await.unwrap();
    }
    assert!(!f.limiter.check("/login", "10.0.0.1", None).await.unwrap().allowed);
    assert!(f.limiter.check("/login", "10.0.0.2", None).await.unwrap().allowed);
    assert!(f.limiter.check("/other", "10.0.0.1", None).await.unwrap().allowed, "default rule");
}

#[tokio::test]
async fn combined_limits_deny_when_user_bucket_is_exhausted() {
    let settings = LimiterSettings {
        use_ip_based: true,
        use_user_based: true,
        combine_limits: true,
        ..login_rule()
    };
    let f = fixture(CircuitBreakerConfig::default(), settings).await;

    // Exhaust alice's bucket from other addresses.
    for i in 0..7 {
        let ip = format!("192.0.2.{i}");
        assert!(f.limiter.check("/login", &ip, Some("alice")).await.unwrap().allowed);
    }

    let d = f.limiter.check("/login", "203.0.113.50", Some("alice")).await.unwrap();
    assert!(!d.allowed, "user scope denies even though the fresh IP bucket has capacity");
    assert_eq!(d.scope, Scope::User);
    assert_eq!(d.remaining, 0);

    // The IP bucket still paid for the attempt.
    let ip_key = f.limiter.bucket_key("/login", Scope::Ip, "203.0.113.50");
    let bytes = f.breaker.get(&ip_key).await.unwrap().expect("ip bucket persisted");
    assert_eq!(TokenBucket::from_bytes(&bytes).unwrap().remaining(), 6);

    // Another user from the same address is unaffected.
    assert!(f.limiter.check("/login", "203.0.113.50", Some("bob")).await.unwrap().allowed);
}

#[tokio::test]
async fn combined_limits_report_the_most_restrictive_scope() {
    let settings = LimiterSettings { use_user_based: true, combine_limits: true, ..login_rule() };
    let f = fixture(CircuitBreakerConfig::default(), settings).await;

    for _ in 0..3 {
        f.limiter.check("/login", "10.1.1.1", None).await.unwrap();
    }
    let d = f.limiter.check("/login", "10.1.1.1", Some("carol")).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.scope, Scope::Ip);
    assert_eq!(d.remaining, 3, "ip bucket has 3 left, user bucket 6");
}

#[tokio::test]
async fn wildcard_rule_shares_one_bucket_across_paths() {
    let settings = LimiterSettings::default().with_rule("/api/*", 2, 0);
    let f = fixture(CircuitBreakerConfig::default(), settings).await;

    assert!(f.limiter.check("/api/users", "ip", None).await.unwrap().allowed);
    let d = f.limiter.check("/api/orders", "ip", None).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.rule, "/api/*");
    assert!(!f.limiter.check("/api/", "ip", None).await.unwrap().allowed);
}

#[tokio::test]
async fn bucket_refills_after_denial() {
    let f = fixture(CircuitBreakerConfig::default(), login_rule()).await;
    for _ in 0..7 {
        f.limiter.check("/login", "ip", None).await.unwrap();
    }
    let denied = f.limiter.check("/login", "ip", None).await.unwrap();
    assert!(!denied.allowed);

    // 5 per minute: one token every 12 seconds.
    f.clock.advance(Duration::from_secs(11));
    assert!(!f.limiter.check("/login", "ip", None).await.unwrap().allowed);
    f.clock.advance(Duration::from_secs(2));
    assert!(f.limiter.check("/login", "ip", None).await.unwrap().allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_in_one_process_stay_within_capacity() {
    let f = fixture(CircuitBreakerConfig::default(), login_rule()).await;
    f.store.set_latency(Duration::from_millis(5));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let limiter = f.limiter.clone();
            tokio::spawn(async move { limiter.check("/login", "198.51.100.9", None).await })
        })
        .collect();
    let results = join_all(tasks).await;
    let allowed = results.into_iter().filter(|r| r.as_ref().unwrap().as_ref().unwrap().allowed).count();
    assert_eq!(allowed, 7, "exactly the bucket capacity is admitted");

    let key = f.limiter.bucket_key("/login", Scope::Ip, "198.51.100.9");
    let bytes = f.breaker.get(&key).await.unwrap().expect("bucket persisted");
    assert_eq!(TokenBucket::from_bytes(&bytes).unwrap().remaining(), 0);
}

#[tokio::test]
async fn clock_regression_does_not_mint_tokens() {
    let f = fixture(CircuitBreakerConfig::default(), login_rule()).await;
    for _ in 0..7 {
        f.limiter.check("/login", "ip", None).await.unwrap();
    }
    f.clock.rewind(Duration::from_secs(120));
    assert!(!f.limiter.check("/login", "ip", None).await.unwrap().allowed);
    f.clock.advance(Duration::from_secs(120));
    assert!(!f.limiter.check("/login", "ip", None).await.unwrap().allowed);
}
