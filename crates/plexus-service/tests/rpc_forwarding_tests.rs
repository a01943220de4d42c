//! RPC integration tests: in-process calls, driver-to-driver
//! forwarding with caller stamping, and failure surfaces.

mod common;

use common::*;
use plexus_service::{responder, Daemon, RpcCaller, Service, StaticConfig};
use plexus_driver::RpcError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn rpc_config(drivers: &[(&str, &str, &str)]) -> Value {
    // (feature, driver name, script)
    let features: Vec<Value> = drivers
        .iter()
        .map(|(feature, _, _)| json!({"name": feature, "required": true}))
        .collect();
    let feature_map: serde_json::Map<String, Value> = drivers
        .iter()
        .map(|(feature, name, _)| (feature.to_string(), json!(name)))
        .collect();
    let metas: serde_json::Map<String, Value> = drivers
        .iter()
        .map(|(_, name, script)| (name.to_string(), sh_driver(name, script)))
        .collect();
    json!({
        "daemon": {
            "features": {"global": features},
            "featureMap": {"global": feature_map},
            "drivers": metas,
        },
    })
}

#[tokio::test]
async fn in_process_call_resolves_against_a_driver() {
    let config = Arc::new(StaticConfig::new(rpc_config(&[(
        "kv",
        "kv",
        RPC_RESPONDER,
    )])));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", test_tunables());
    service.boot().await.expect("boot");
    service.receiver("kv").await.expect("kv alive");

    let reply = service
        .call("kv", "get", &json!({"key": "host"}))
        .await
        .expect("rpc call");
    let reply: Value = serde_json::from_slice(&reply).expect("json reply");
    assert_eq!(reply, json!({"pong": true}));
    assert_eq!(service.rpc_registry().pending_count(), 0);
}

#[tokio::test]
async fn driver_to_driver_call_is_forwarded_with_caller_stamped() {
    // Driver "alpha" emits an rpc:call addressed at feature "beta";
    // the supervisor must stamp caller=alpha and forward. Beta's reply
    // routes back to alpha, which announces success on the eventbus.
    let alpha_script = r#"printf 'state alive 0\n'
sleep 0.5
body='{"labels":{"feature":"beta","rpcID":"42.0"},"content":{"ping":1}}'
printf 'rpc call %s\n%s' "${#body}" "$body"
while read -r ch sub size; do
  [ "$size" -gt 0 ] && dd bs=1 count="$size" >/dev/null 2>&1
  if [ "$ch" = rpc ] && [ "$sub" = return ]; then
    printf 'eventbus message 0\n'
  fi
done"#;

    let config = Arc::new(StaticConfig::new(rpc_config(&[
        ("alpha", "alpha", alpha_script),
        ("beta", "beta", RPC_RESPONDER),
    ])));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", test_tunables());

    // Observe alpha's success marker.
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(1);
    service.add_responder(
        "eventbus",
        "message",
        responder(move |_svc, from, _msg| {
            let seen_tx = seen_tx.clone();
            let feature = from.feature().to_string();
            async move {
                let _ = seen_tx.send(feature).await;
            }
        }),
    );

    service.boot().await.expect("boot");
    service.receiver("alpha").await.expect("alpha alive");
    service.receiver("beta").await.expect("beta alive");

    let from = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("alpha should receive the rpc return")
        .unwrap();
    assert_eq!(from, "alpha");
}

#[tokio::test]
async fn call_to_an_unloaded_feature_fails_fast() {
    let config = Arc::new(StaticConfig::new(rpc_config(&[(
        "kv",
        "kv",
        RPC_RESPONDER,
    )])));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", test_tunables());
    service.boot().await.expect("boot");

    let err = service
        .call("ghost", "get", &json!({}))
        .await
        .expect_err("no runtime for ghost");
    assert!(matches!(err, RpcError::FeatureUnavailable(_)));
}

#[tokio::test]
async fn call_times_out_when_the_driver_stays_silent() {
    let mut tunables = test_tunables();
    tunables.rpc_timeout = Duration::from_millis(200);

    let config = Arc::new(StaticConfig::new(rpc_config(&[(
        "kv",
        "kv",
        ALIVE_THEN_IDLE,
    )])));
    let daemon = Daemon::with_id("test-daemon");
    let service = Service::with_tunables(&daemon, config, "engine", tunables);
    service.boot().await.expect("boot");
    service.receiver("kv").await.expect("kv alive");

    let err = service
        .call("kv", "get", &json!({}))
        .await
        .expect_err("silent driver");
    assert!(matches!(err, RpcError::Timeout { .. }));
    assert_eq!(service.rpc_registry().pending_count(), 0);
}
