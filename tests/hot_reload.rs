mod common;

use common::test_helpers::{capture_logs, fixture};
use std::time::Duration;
use storeguard::telemetry::{ConfigEvent, GuardEvent};
use storeguard::{CircuitBreakerConfig, LimiterSettings};

fn settings(login_limit: i64, interval_secs: u64) -> LimiterSettings {
    LimiterSettings {
        hot_reload_interval_secs: interval_secs,
        ..LimiterSettings::default().with_rule("/login", login_limit, 0)
    }
}

fn login_limit(f: &common::test_helpers::Fixture) -> u32 {
    f.limiter.config().rules().resolve("/login").rule.limit()
}

#[tokio::test(start_paused = true)]
async fn reload_loop_swaps_snapshots_on_interval() {
    let f = fixture(CircuitBreakerConfig::default(), settings(5, 5)).await;
    let task = f.limiter.spawn_hot_reload().expect("hot reload enabled");
    let held = f.limiter.config();

    f.provider.update(settings(1, 20));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(login_limit(&f), 5, "not reloaded before the interval");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(login_limit(&f), 1);
    assert_eq!(held.rules().resolve("/login").rule.limit(), 5, "held snapshot is immutable");

    // The new snapshot stretched the interval to 20s.
    f.provider.update(settings(3, 20));
    tokio::time::sleep(Duration::from_secs(14)).await;
    assert_eq!(login_limit(&f), 1);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(login_limit(&f), 3);

    let reloads = f
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, GuardEvent::Config(ConfigEvent::Reloaded { .. })))
        .count();
    assert_eq!(reloads, 2);

    task.shutdown().await;
    f.provider.update(settings(9, 20));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(login_limit(&f), 3, "no reloads after shutdown");
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_logged_and_previous_snapshot_kept() {
    let logs = capture_logs();
    let f = fixture(CircuitBreakerConfig::default(), settings(5, 5)).await;
    let task = f.limiter.spawn_hot_reload().expect("hot reload enabled");

    f.provider.update(settings(-5, 5));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(login_limit(&f), 5);
    assert!(f.limiter.check("/login", "ip", None).await.unwrap().allowed);

    let output = logs.contents();
    assert!(output.contains("rejected rate limiter configuration"));
    assert!(output.contains("/login"));
    assert!(f
        .events
        .events()
        .iter()
        .any(|e| matches!(e, GuardEvent::Config(ConfigEvent::Rejected { .. }))));

    // The loop keeps polling and picks up the fix.
    f.provider.update(settings(2, 5));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(login_limit(&f), 2);

    drop(task);
}

#[tokio::test]
async fn in_flight_check_uses_one_snapshot() {
    let f = fixture(CircuitBreakerConfig::default(), settings(5, 0)).await;
    f.store.set_latency(Duration::from_millis(20));

    let check = f.limiter.check("/login", "ip", None);
    let reload = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.provider.update(settings(1, 0));
        f.limiter.reload().await.unwrap();
    };
    let (decision, ()) = tokio::join!(check, reload);
    let decision = decision.unwrap();
    assert_eq!((decision.limit, decision.remaining), (5, 4));
    assert_eq!(login_limit(&f), 1);
}
