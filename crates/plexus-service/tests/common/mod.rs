//! Shared fixtures: shell-scripted drivers speaking the wire protocol.
#![allow(dead_code)]

use plexus_service::Tunables;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

/// Driver that announces itself and then swallows its stdin.
pub const ALIVE_THEN_IDLE: &str = "printf 'state alive 0\\n'; cat >/dev/null";

/// Driver that never becomes alive.
pub const NEVER_ALIVE: &str = "cat >/dev/null";

/// Driver that re-announces `state:alive` after every inbound frame,
/// the way a real driver confirms a `command:options` push.
pub const ALIVE_ECHO: &str = r#"printf 'state alive 0\n'
while read -r ch sub size; do
  [ "$size" -gt 0 ] && dd bs=1 count="$size" >/dev/null 2>&1
  printf 'state alive 0\n'
done"#;

/// Driver that acknowledges `command:stop` with `state:stopped`.
pub const STOPPABLE: &str = r#"printf 'state alive 0\n'
while read -r ch sub size; do
  [ "$size" -gt 0 ] && dd bs=1 count="$size" >/dev/null 2>&1
  if [ "$ch" = command ] && [ "$sub" = stop ]; then
    printf 'state stopped 0\n'
    exit 0
  fi
done"#;

/// Driver that answers every `rpc:call` with an `rpc:return` carrying
/// the same `rpcID` and `caller` and a `{"pong":true}` payload.
pub const RPC_RESPONDER: &str = r#"printf 'state alive 0\n'
while read -r ch sub size; do
  payload=''
  [ "$size" -gt 0 ] && payload=$(dd bs=1 count="$size" 2>/dev/null)
  if [ "$ch" = rpc ] && [ "$sub" = call ]; then
    id=$(printf '%s' "$payload" | sed 's/.*"rpcID":"\([^"]*\)".*/\1/')
    caller=$(printf '%s' "$payload" | sed 's/.*"caller":"\([^"]*\)".*/\1/')
    body="{\"labels\":{\"caller\":\"$caller\",\"rpcID\":\"$id\"},\"content\":{\"pong\":true}}"
    printf 'rpc return %s\n%s' "${#body}" "$body"
  fi
done"#;

/// Metadata value for a `/bin/sh -c` driver.
pub fn sh_driver(name: &str, script: &str) -> Value {
    json!({
        "name": name,
        "executable": "/bin/sh",
        "arguments": ["-c", script],
    })
}

/// Timing knobs shrunk for tests.
pub fn test_tunables() -> Tunables {
    Tunables {
        ready_timeout: Duration::from_secs(2),
        graceful_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(50),
        retry_count: 3,
        drain_timeout: Duration::from_secs(1),
        rpc_timeout: Duration::from_secs(2),
        metrics_interval: Duration::from_secs(60),
        boot_settle: Duration::from_millis(50),
    }
}

/// Polls `check` until it yields `true` or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
