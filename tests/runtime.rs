use std::sync::Arc;
use std::time::Duration;
use storeguard::telemetry::{BreakerEvent, MemorySink};
use storeguard::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ConfigError, FailureStrategy,
    GuardRuntime, InMemoryStore, JsonFileConfigProvider, LimiterSettings, ManualClock,
    StaticConfigProvider,
};

#[tokio::test]
async fn starts_from_json_file_and_serves_checks() {
    let path = std::env::temp_dir().join(format!("storeguard-runtime-{}.json", std::process::id()));
    tokio::fs::write(
        &path,
        br#"{
            "default_limit": 60,
            "endpoint_rules": { "/login": { "limit": 5, "burst": 2 } },
            "use_user_based": true,
            "combine_limits": true,
            "hot_reload_interval_secs": 30
        }"#,
    )
    .await
    .unwrap();

    let runtime = GuardRuntime::start(
        Arc::new(InMemoryStore::new()),
        CircuitBreakerConfig::default(),
        Arc::new(JsonFileConfigProvider::new(&path)),
    )
    .await
    .unwrap();
    assert_eq!(runtime.task_names(), vec!["circuit_breaker_health_check", "rate_limit_hot_reload"]);

    let d = runtime.limiter().check("/login", "203.0.113.7", Some("alice")).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.remaining, 6);

    let status = runtime.status();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.strategy, FailureStrategy::Degraded);
    assert_eq!(status.local_cache_size, 2, "ip and user buckets written through");
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "CLOSED");
    assert!(json["time_until_recovery_secs"].is_null());

    runtime.shutdown().await;
    tokio::fs::remove_file(&path).await.unwrap();
}

#[tokio::test]
async fn invalid_initial_config_fails_fast() {
    let provider =
        StaticConfigProvider::new(LimiterSettings { use_ip_based: false, ..Default::default() });
    let err = GuardRuntime::start(
        Arc::new(InMemoryStore::new()),
        CircuitBreakerConfig::default(),
        Arc::new(provider),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ConfigError::NoScopeEnabled));

    let err = GuardRuntime::start(
        Arc::new(InMemoryStore::new()),
        CircuitBreakerConfig::default(),
        Arc::new(JsonFileConfigProvider::new("/nonexistent/storeguard.json")),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[tokio::test(start_paused = true)]
async fn health_check_recovers_breaker_without_traffic() {
    let clock = ManualClock::default();
    let store = InMemoryStore::with_clock(clock.clone());
    let events = MemorySink::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .recovery_timeout(Duration::from_secs(5))
        .half_open_max_probe(2)
        .health_check_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let breaker = Arc::new(
        CircuitBreaker::with_parts(
            Arc::new(store.clone()),
            config,
            Arc::new(clock.clone()),
            Arc::new(events.clone()),
        )
        .unwrap(),
    );
    let runtime = GuardRuntime::assemble(
        breaker,
        Arc::new(StaticConfigProvider::new(LimiterSettings::default())),
        Arc::new(events.clone()),
    )
    .await
    .unwrap();
    assert_eq!(runtime.task_names(), vec!["circuit_breaker_health_check"]);

    // Health pings fail while the store is down and trip the breaker.
    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(runtime.breaker().state(), CircuitState::Open);

    store.set_available(true);
    clock.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runtime.breaker().state(), CircuitState::Closed);

    let transitions: Vec<_> = events
        .breaker_events()
        .into_iter()
        .filter(|e| matches!(e, BreakerEvent::Opened { .. } | BreakerEvent::HalfOpen | BreakerEvent::Closed))
        .collect();
    assert_eq!(
        transitions,
        vec![BreakerEvent::Opened { failure_count: 2 }, BreakerEvent::HalfOpen, BreakerEvent::Closed]
    );

    runtime.shutdown().await;
    let calls = store.calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.calls(), calls);
}
