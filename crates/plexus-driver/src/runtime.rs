//! The driver runtime: one supervised incarnation of a driver process.

use crate::error::DriverError;
use crate::handler::DriverHandler;
use crate::meta::DriverMeta;
use crate::state::DriverState;
use plexus_types::RuntimeId;
use plexus_wire::{codec, Message, CHANNEL_COMMAND, SUBJECT_OPTIONS};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Capacity of a runtime's inbound message channel.
///
/// Bounded so a driver flooding the daemon backpressures onto its own
/// stdout instead of growing daemon memory.
pub const INBOUND_BUFFER: usize = 64;

/// Descriptor for a driver runtime that has not been spawned yet.
///
/// The supervisor builds a spec per reload pass and compares it to the
/// installed runtime to pick a no-op, hot reload or cold reload.
#[derive(Debug, Clone)]
pub struct DriverSpec {
    /// Feature slot this runtime will occupy.
    pub feature: String,
    /// How to launch the executable.
    pub meta: DriverMeta,
    /// Driver configuration snapshot.
    pub data: Option<Value>,
    /// Per-feature dynamic configuration snapshot.
    pub dynamic_data: Option<Value>,
}

impl DriverSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(
        feature: impl Into<String>,
        meta: DriverMeta,
        data: Option<Value>,
        dynamic_data: Option<Value>,
    ) -> Self {
        Self {
            feature: feature.into(),
            meta,
            data,
            dynamic_data,
        }
    }
}

/// One live incarnation of a driver subprocess.
///
/// Created in `Loading` state by [`start`](Self::start); the service
/// supervisor moves it to `Alive` when the driver's `state:alive`
/// message arrives. Identity ([`RuntimeId`]) is fresh per incarnation:
/// hot reloads mutate this object in place, cold reloads replace it.
pub struct DriverRuntime {
    id: RuntimeId,
    feature: String,
    service: String,
    handler: DriverHandler,
    data: parking_lot::RwLock<Option<Value>>,
    dynamic_data: parking_lot::RwLock<Option<Value>>,
    state: watch::Sender<DriverState>,
    inbound: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl DriverRuntime {
    /// Spawns the driver process and wires up its streams.
    ///
    /// On success the runtime is `Loading`, its stdout is being pumped
    /// into the inbound channel, stderr is forwarded to the process
    /// log, and the initial `command:options` snapshot has been sent.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Spawn`] when the process cannot start,
    /// or the wire error from the initial options push.
    pub async fn start(spec: DriverSpec, service: &str) -> Result<Arc<Self>, DriverError> {
        let (handler, stdout, stderr) = DriverHandler::spawn(spec.meta)?;
        let driver = handler.meta().name.clone();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let runtime = Arc::new(Self {
            id: RuntimeId::new(),
            feature: spec.feature,
            service: service.to_string(),
            handler,
            data: parking_lot::RwLock::new(spec.data),
            dynamic_data: parking_lot::RwLock::new(spec.dynamic_data),
            state: watch::Sender::new(DriverState::Loading),
            inbound: parking_lot::Mutex::new(Some(inbound_rx)),
        });

        // Producer: one task per driver pumps stdout frames into the
        // inbound channel; dropping the sender is the crash signal.
        {
            let service = runtime.service.clone();
            let driver = driver.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    match codec::read_message(&mut reader).await {
                        Ok(Some(msg)) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(service, driver, "driver output closed");
                            break;
                        }
                        Err(err) => {
                            warn!(service, driver, error = %err, "driver stream error");
                            break;
                        }
                    }
                }
            });
        }

        // stderr goes to the process log, tagged by driver.
        {
            let service = runtime.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "plexus::driver_stderr", service, driver, "{line}");
                }
            });
        }

        runtime.send_options().await?;
        Ok(runtime)
    }

    /// Identity of this incarnation.
    #[must_use]
    pub fn id(&self) -> RuntimeId {
        self.id
    }

    /// Feature slot this runtime occupies.
    #[must_use]
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Name of the owning service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The owned child process.
    #[must_use]
    pub fn handler(&self) -> &DriverHandler {
        &self.handler
    }

    /// Driver name from the launch metadata.
    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.handler.meta().name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Moves the runtime to a new state.
    pub fn set_state(&self, state: DriverState) {
        self.state.send_replace(state);
    }

    /// Clone of the driver data snapshot.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.data.read().clone()
    }

    /// Clone of the dynamic data snapshot.
    #[must_use]
    pub fn dynamic_data(&self) -> Option<Value> {
        self.dynamic_data.read().clone()
    }

    /// Takes the inbound message stream.
    ///
    /// The supervisor pumps this into its unified dispatch channel;
    /// it can be taken once per incarnation.
    #[must_use]
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound.lock().take()
    }

    /// Blocks until the runtime is `Alive`, or fails after `timeout`.
    ///
    /// # Errors
    ///
    /// [`DriverError::ReadyTimeout`] on deadline,
    /// [`DriverError::Terminated`] when the runtime is torn down while
    /// waiting.
    pub async fn ready(&self, timeout: Duration) -> Result<(), DriverError> {
        let mut state = self.state.subscribe();
        let result = tokio::time::timeout(timeout, state.wait_for(|s| *s == DriverState::Alive)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(DriverError::Terminated {
                name: self.driver_name().to_string(),
            }),
            Err(_) => Err(DriverError::ReadyTimeout {
                name: self.driver_name().to_string(),
            }),
        }
    }

    /// Sends one message to the driver's stdin.
    ///
    /// A write failure marks the runtime `Failed`; the crash-recovery
    /// path owns what happens next.
    pub async fn send_message(&self, msg: &Message) -> Result<(), DriverError> {
        if let Err(err) = self.handler.stdin().send(msg).await {
            warn!(
                service = self.service,
                driver = self.driver_name(),
                error = %err,
                "driver write failed"
            );
            self.set_state(DriverState::Failed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Pushes the current data snapshots as a `command:options` message.
    pub async fn send_options(&self) -> Result<(), DriverError> {
        let options = json!({
            "data": self.data(),
            "dynamicData": self.dynamic_data(),
        });
        self.send_message(&Message::new(CHANNEL_COMMAND, SUBJECT_OPTIONS).with_value(options))
            .await
    }

    /// Applies a hot reload: swaps data snapshots in place and marks
    /// the runtime `Reloading`.
    ///
    /// The caller follows up with [`send_options`](Self::send_options);
    /// the driver's next `state:alive` restores `Alive`.
    pub fn apply_hot(&self, data: Option<Value>, dynamic_data: Option<Value>) {
        *self.data.write() = data;
        *self.dynamic_data.write() = dynamic_data;
        self.set_state(DriverState::Reloading);
    }

    /// Closes the driver process. Idempotent.
    pub async fn close(&self) {
        self.handler.close().await;
    }
}

impl std::fmt::Debug for DriverRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRuntime")
            .field("id", &self.id)
            .field("feature", &self.feature)
            .field("service", &self.service)
            .field("driver", &self.driver_name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_wire::{CHANNEL_STATE, SUBJECT_ALIVE};

    fn sh_spec(feature: &str, name: &str, script: &str) -> DriverSpec {
        DriverSpec::new(
            feature,
            DriverMeta {
                name: name.into(),
                executable: "/bin/sh".into(),
                arguments: vec!["-c".into(), script.into()],
            },
            None,
            None,
        )
    }

    #[tokio::test]
    async fn start_pumps_driver_messages_inbound() {
        let spec = sh_spec("echo", "echo", "printf 'state alive 0\\n'; cat >/dev/null");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();
        assert_eq!(runtime.state(), DriverState::Loading);

        let mut inbound = runtime.take_inbound().unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, CHANNEL_STATE);
        assert_eq!(msg.subject, SUBJECT_ALIVE);

        assert!(runtime.take_inbound().is_none());
        runtime.close().await;
    }

    #[tokio::test]
    async fn inbound_closes_when_driver_exits() {
        let spec = sh_spec("oneshot", "oneshot", "printf 'state alive 0\\n'");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();

        let mut inbound = runtime.take_inbound().unwrap();
        assert!(inbound.recv().await.is_some());
        // Driver exited; the producer drops its sender.
        assert!(inbound.recv().await.is_none());
        runtime.close().await;
    }

    #[tokio::test]
    async fn ready_resolves_once_alive() {
        let spec = sh_spec("kv", "kv", "cat >/dev/null");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();

        let waiter = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.ready(Duration::from_secs(5)).await })
        };
        runtime.set_state(DriverState::Alive);
        waiter.await.unwrap().unwrap();
        runtime.close().await;
    }

    #[tokio::test]
    async fn ready_times_out_on_silent_driver() {
        let spec = sh_spec("mute", "mute", "cat >/dev/null");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();

        let err = runtime.ready(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DriverError::ReadyTimeout { .. }));
        runtime.close().await;
    }

    #[tokio::test]
    async fn write_failure_marks_runtime_failed() {
        let spec = sh_spec("gone", "gone", "sleep 0.1");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();
        runtime.set_state(DriverState::Alive);

        // Reap the child so the pipe is definitely dead.
        runtime.handler().wait().await;

        let msg = Message::new(CHANNEL_COMMAND, "noop");
        assert!(runtime.send_message(&msg).await.is_err());
        assert_eq!(runtime.state(), DriverState::Failed);
    }

    #[tokio::test]
    async fn hot_reload_preserves_identity_and_updates_data() {
        let spec = sh_spec("kv", "kv", "cat >/dev/null");
        let runtime = DriverRuntime::start(spec, "testsvc").await.unwrap();
        runtime.set_state(DriverState::Alive);
        let id = runtime.id();

        runtime.apply_hot(Some(json!({"ttl": 60})), None);
        assert_eq!(runtime.id(), id);
        assert_eq!(runtime.state(), DriverState::Reloading);
        assert_eq!(runtime.data(), Some(json!({"ttl": 60})));
        runtime.close().await;
    }
}
