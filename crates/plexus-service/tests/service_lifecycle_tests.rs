//! Service lifecycle integration tests: boot, hot/cold reload,
//! reload rollback, crash recovery and drain, all against real
//! `/bin/sh` driver subprocesses.

mod common;

use common::*;
use plexus_driver::DriverState;
use plexus_service::{Daemon, Service, Stage, StaticConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn single_feature_config(feature: &str, driver: Value, required: bool) -> Value {
    let driver_name = driver["name"].as_str().unwrap().to_string();
    json!({
        "daemon": {
            "features": {
                "global": [{"name": feature, "required": required}],
            },
            "featureMap": {
                "global": {feature: driver_name.clone()},
            },
            "drivers": {driver_name: driver},
        },
    })
}

async fn booted(
    config: Arc<StaticConfig>,
) -> (Arc<Daemon>, Arc<Service>) {
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", test_tunables());
    service.boot().await.expect("boot");
    (daemon, service)
}

#[tokio::test]
async fn boot_loads_required_feature_to_alive() {
    let config = Arc::new(StaticConfig::new(single_feature_config(
        "eventbus",
        sh_driver("bus", ALIVE_THEN_IDLE),
        true,
    )));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    let runtime = service.receiver("eventbus").await.expect("eventbus ready");
    assert_eq!(runtime.state(), DriverState::Alive);
    assert_eq!(runtime.feature(), "eventbus");
    assert_eq!(runtime.service(), "engine");
    assert_eq!(config.stage_of("engine"), Some(Stage::Serving));
    assert!(service.check_health());
}

#[tokio::test]
async fn optional_feature_failure_is_not_fatal() {
    let mut tunables = test_tunables();
    tunables.ready_timeout = Duration::from_millis(200);

    let config = Arc::new(StaticConfig::new(single_feature_config(
        "mute",
        sh_driver("mute", NEVER_ALIVE),
        false,
    )));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", tunables);
    service.boot().await.expect("boot");

    assert!(
        wait_for(Duration::from_secs(2), || async {
            service
                .runtime("mute")
                .is_some_and(|rt| rt.state() == DriverState::Failed)
        })
        .await,
        "silent optional driver should end up Failed"
    );
    assert!(service.check_health());
}

#[tokio::test]
async fn hot_reload_preserves_runtime_identity() {
    let mut staged = single_feature_config("eventbus", sh_driver("bus", ALIVE_ECHO), true);
    staged["bus"] = json!({"ttl": 1});
    let config = Arc::new(StaticConfig::new(staged.clone()));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    let before = service.receiver("eventbus").await.expect("boot alive");
    assert_eq!(before.data(), Some(json!({"ttl": 1})));

    staged["bus"] = json!({"ttl": 60});
    config.set_staged(staged);
    service.reload().await;

    assert!(
        wait_for(Duration::from_secs(3), || async {
            service
                .runtime("eventbus")
                .is_some_and(|rt| rt.state() == DriverState::Alive)
        })
        .await,
        "driver should confirm alive after options push"
    );
    let after = service.runtime("eventbus").unwrap();
    assert_eq!(after.id(), before.id(), "hot reload must keep identity");
    assert_eq!(after.data(), Some(json!({"ttl": 60})));
    assert_eq!(config.rollback_count(), 0);
}

#[tokio::test]
async fn cold_reload_replaces_runtime_identity() {
    let staged = single_feature_config("eventbus", sh_driver("bus", ALIVE_ECHO), true);
    let config = Arc::new(StaticConfig::new(staged));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    let before = service.receiver("eventbus").await.expect("boot alive");

    // A changed argument list is a changed driver descriptor.
    let mut meta = sh_driver("bus", ALIVE_ECHO);
    meta["arguments"] = json!(["-c", format!("true; {ALIVE_ECHO}")]);
    config.set_staged(single_feature_config("eventbus", meta, true));
    service.reload().await;

    assert!(
        wait_for(Duration::from_secs(3), || async {
            service
                .runtime("eventbus")
                .is_some_and(|rt| rt.id() != before.id() && rt.state() == DriverState::Alive)
        })
        .await,
        "cold reload must install a fresh incarnation"
    );
    assert_eq!(config.rollback_count(), 0);
}

#[tokio::test]
async fn unchanged_config_reload_is_a_noop() {
    let staged = single_feature_config("eventbus", sh_driver("bus", ALIVE_ECHO), true);
    let config = Arc::new(StaticConfig::new(staged));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    let before = service.receiver("eventbus").await.expect("boot alive");
    service.reload().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = service.runtime("eventbus").unwrap();
    assert_eq!(after.id(), before.id());
    assert_eq!(after.state(), DriverState::Alive);
}

#[tokio::test]
async fn required_reload_timeout_rolls_back_exactly_once() {
    let mut tunables = test_tunables();
    tunables.ready_timeout = Duration::from_millis(300);

    let staged = single_feature_config("eventbus", sh_driver("bus", ALIVE_ECHO), true);
    let config = Arc::new(StaticConfig::new(staged));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, Arc::clone(&config) as _, "engine", tunables);
    service.boot().await.expect("boot");
    service.receiver("eventbus").await.expect("boot alive");

    // New descriptor whose driver never reports alive.
    config.set_staged(single_feature_config(
        "eventbus",
        sh_driver("bus-v2", NEVER_ALIVE),
        true,
    ));
    service.reload().await;

    assert!(
        wait_for(Duration::from_secs(2), || async {
            config.rollback_count() == 1
        })
        .await,
        "alive timeout on a required reload must roll back"
    );
    assert!(
        service
            .runtime("eventbus")
            .is_some_and(|rt| rt.state() == DriverState::Failed),
        "slot must end Failed"
    );
    // Exactly once: give a second timer a chance to misfire.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(config.rollback_count(), 1);
}

#[tokio::test]
async fn crashed_driver_is_recovered_with_a_fresh_incarnation() {
    let config = Arc::new(StaticConfig::new(single_feature_config(
        "flaky",
        sh_driver("flaky", ALIVE_THEN_IDLE),
        true,
    )));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    let before = service.receiver("flaky").await.expect("boot alive");

    // Closing stdin makes the driver exit: an Alive stream closing is
    // the crash signal.
    before.close().await;

    assert!(
        wait_for(Duration::from_secs(5), || async {
            service
                .runtime("flaky")
                .is_some_and(|rt| rt.id() != before.id() && rt.state() == DriverState::Alive)
        })
        .await,
        "crashed driver should be reloaded to Alive"
    );
}

#[tokio::test]
async fn drain_stops_drivers_and_advances_stage() {
    let staged = json!({
        "daemon": {
            "features": {
                "global": [{"name": "eventbus", "required": true}],
                "engine": [{"name": "driver:worker", "required": true}],
            },
            "featureMap": {
                "global": {"eventbus": "bus"},
            },
            "drivers": {
                "bus": sh_driver("bus", STOPPABLE),
                "worker": sh_driver("worker", STOPPABLE),
            },
        },
    });
    let config = Arc::new(StaticConfig::new(staged));
    let (_daemon, service) = booted(Arc::clone(&config)).await;

    service.receiver("eventbus").await.expect("eventbus alive");
    service.receiver("driver:worker").await.expect("worker alive");

    // Hold references: the reaper clears slots once the drivers exit.
    let runtimes = service.runtimes();
    assert_eq!(runtimes.len(), 2);

    let started = tokio::time::Instant::now();
    service.drain().await;

    assert!(
        started.elapsed() < Duration::from_secs(1),
        "acked drain must not run into the timeout"
    );
    assert!(!service.check_health());
    assert_eq!(config.stage_of("engine"), Some(Stage::Drained));
    for runtime in runtimes {
        assert_eq!(runtime.state(), DriverState::Stopped);
    }
}
