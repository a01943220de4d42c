//! The dispatch loop and the built-in control plane.
//!
//! Every installed runtime gets a pump task forwarding its inbound
//! messages into one unified channel as tagged envelopes; the channel
//! closing for a runtime is synthesized as a `Closed` envelope. The
//! loop multiplexes that channel against a one-second tick that
//! observes daemon shutdown.

use super::{responder, Service, FEATURE_EMITTER, FEATURE_EVENTBUS, METRIC_MESSAGE};
use crate::config::Stage;
use crate::gate::DrainGate;
use crate::service::lifecycle::truthy;
use crate::task::{run_contained, spawn_contained};
use plexus_driver::{DriverRuntime, DriverState, RpcCaller};
use plexus_wire::{
    Message, CHANNEL_API, CHANNEL_BROADCAST, CHANNEL_COMMAND, CHANNEL_RPC, CHANNEL_STATE,
    LABEL_CALLER, LABEL_DAEMON_ID, LABEL_FEATURE, LABEL_FN, NO_CALLER, SUBJECT_CALL, SUBJECT_COLD,
    SUBJECT_RELOAD, SUBJECT_RETURN, SUBJECT_STOP, SUBJECT_STOPPED,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tagged envelope on the unified dispatch channel.
pub(crate) enum ServiceEvent {
    /// A message arrived from a runtime's stream.
    Inbound {
        runtime: Arc<DriverRuntime>,
        message: Message,
    },
    /// A runtime's stream closed (crash or clean exit).
    Closed { runtime: Arc<DriverRuntime> },
}

/// Seeds the fixed control-plane responders. Called once from the
/// constructor; the table is append-only afterwards.
pub(super) fn install_control_plane(service: &Arc<Service>) {
    service.add_responder(CHANNEL_STATE, SUBJECT_COLD, responder(handle_cold_request));
    service.add_responder(CHANNEL_STATE, SUBJECT_STOPPED, responder(handle_driver_stop));
    service.add_responder(CHANNEL_RPC, SUBJECT_CALL, responder(handle_rpc_call));
    service.add_responder(CHANNEL_RPC, SUBJECT_RETURN, responder(handle_rpc_return));
    service.add_responder(CHANNEL_BROADCAST, SUBJECT_RELOAD, responder(handle_reload));
    service.add_responder(CHANNEL_API, SUBJECT_CALL, responder(handle_api));
}

impl Service {
    /// Starts the pump task bridging a runtime's inbound stream onto
    /// the unified dispatch channel.
    pub(crate) fn attach_pump(self: &Arc<Self>, runtime: &Arc<DriverRuntime>) {
        let Some(mut inbound) = runtime.take_inbound() else {
            return;
        };
        let events = self.events_tx();
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let envelope = ServiceEvent::Inbound {
                    runtime: Arc::clone(&runtime),
                    message,
                };
                if events.send(envelope).await.is_err() {
                    return;
                }
            }
            let _ = events.send(ServiceEvent::Closed { runtime }).await;
        });
    }

    /// The service's single dispatch loop.
    ///
    /// Exits when the daemon shuts down; closes every runtime on the
    /// way out.
    pub(crate) async fn dispatch_loop(self: Arc<Self>) {
        let Some(mut events) = self.take_events_rx() else {
            warn!(service = self.name(), "dispatch loop already running");
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ServiceEvent::Inbound { runtime, message }) => {
                        self.on_inbound(&runtime, message);
                    }
                    Some(ServiceEvent::Closed { runtime }) => self.on_closed(&runtime),
                    None => break,
                },
                _ = tick.tick() => {
                    if self.daemon().is_shutting_down() {
                        break;
                    }
                }
            }
        }

        self.set_healthy(false);
        self.close_runtimes().await;
        info!(service = self.name(), "service closed for business");
    }

    fn on_inbound(self: &Arc<Self>, runtime: &Arc<DriverRuntime>, message: Message) {
        if runtime.feature() != FEATURE_EMITTER {
            if let Some(emitter) = self.daemon().emitter_for(self.name()) {
                emitter.counter_incr(
                    METRIC_MESSAGE,
                    vec![
                        format!("service:{}", self.name()),
                        format!("driver:{}", runtime.driver_name()),
                        "direction:inbound".to_string(),
                        format!("channel:{}", message.channel),
                        format!("subject:{}", message.subject),
                    ],
                );
            }
        }
        self.process(runtime, message);
    }

    /// Dispatches one message through expects, responders and the
    /// transformer/router chain. Handler fan-out is concurrent; none
    /// of the layers observes another's effects.
    pub(crate) fn process(self: &Arc<Self>, runtime: &Arc<DriverRuntime>, message: Message) {
        let expect_key = format!(
            "{}:{}:{}",
            message.channel,
            message.subject,
            runtime.driver_name()
        );
        if let Some(handlers) = self.expects().take(&expect_key) {
            for handler in handlers {
                let name = self.name().to_string();
                let msg = message.clone();
                spawn_contained(self.name(), "expect", async move {
                    run_contained(&name, "expect", || (*handler)(&msg));
                });
            }
        }

        let key = format!("{}:{}", message.channel, message.subject);
        if let Some(responders) = self.responders.read().get(&key).cloned() {
            for respond in responders {
                spawn_contained(
                    self.name(),
                    "responder",
                    (*respond)(Arc::clone(self), Arc::clone(runtime), message.clone()),
                );
            }
        }

        let service = Arc::clone(self);
        let runtime = Arc::clone(runtime);
        spawn_contained(self.name(), "route", async move {
            let mut current = Some(message);
            if let Some(transformers) = service.transformers.read().get(&key).cloned() {
                for transform in transformers {
                    match current.take() {
                        Some(msg) => current = (*transform)(&runtime, msg),
                        None => break,
                    }
                }
            }
            let (Some(msg), Some(route)) = (current, service.router.read().clone()) else {
                return;
            };
            for routed in (*route)(&msg) {
                if let Err(err) = routed.runtime.send_message(&routed.message).await {
                    warn!(
                        service = service.name(),
                        feature = routed.runtime.feature(),
                        error = %err,
                        "routed send failed"
                    );
                }
            }
        });
    }

    /// A runtime's stream closed. Retired incarnations (replaced,
    /// unused, self-requested cold reload) are marked `Stopped` before
    /// their close and get no crash treatment; neither does a stale
    /// pump whose slot a newer incarnation already owns. A crashed
    /// driver's slot may have been cleared by its reaper task first,
    /// so an empty slot still counts as current here.
    fn on_closed(self: &Arc<Self>, runtime: &Arc<DriverRuntime>) {
        let is_current = self
            .runtime(runtime.feature())
            .is_none_or(|current| current.id() == runtime.id());
        if !is_current {
            return;
        }

        if runtime.feature() == FEATURE_EMITTER {
            self.daemon().remove_emitter(self.name());
        }
        if runtime.state() == DriverState::Alive {
            debug!(
                service = self.name(),
                driver = runtime.driver_name(),
                "driver stream closed, starting recovery"
            );
            let service = Arc::clone(self);
            let runtime = Arc::clone(runtime);
            tokio::spawn(service.recover_runtime(runtime));
        }
    }

    /// Stops accepting traffic and asks every live driver to stop.
    ///
    /// Sends `command:stop` to each runtime outside {Failed, Stopped},
    /// waits up to the drain timeout for their `state:stopped` acks,
    /// then advances the config stage to `Drained`.
    pub async fn drain(self: &Arc<Self>) {
        self.set_healthy(false);

        let targets: Vec<Arc<DriverRuntime>> = self
            .runtimes()
            .into_iter()
            .filter(|rt| !rt.state().is_down())
            .collect();

        if !targets.is_empty() {
            let gate = DrainGate::new(targets.len());
            self.set_drain_gate(Some(gate.clone()));

            for runtime in &targets {
                if let Err(err) = runtime
                    .send_message(&Message::new(CHANNEL_COMMAND, SUBJECT_STOP))
                    .await
                {
                    warn!(
                        service = self.name(),
                        driver = runtime.driver_name(),
                        error = %err,
                        "stop command failed"
                    );
                    gate.done_one();
                }
            }

            if !gate.wait(self.tunables().drain_timeout).await {
                warn!(service = self.name(), "drain timed out with drivers still running");
            }
            self.set_drain_gate(None);
        }

        if let Err(err) = self
            .config()
            .advance_stage(self.name(), Stage::Drained, None)
        {
            warn!(service = self.name(), error = %err, "failed to advance to drained");
        }
    }
}

/// `state:cold`: the driver asks to be cold-restarted.
async fn handle_cold_request(service: Arc<Service>, runtime: Arc<DriverRuntime>, _msg: Message) {
    info!(
        service = service.name(),
        driver = runtime.driver_name(),
        "driver requested cold reload"
    );
    service.check_delete_runtime(runtime.feature(), runtime.id());
    runtime.set_state(DriverState::Stopped);
    runtime.close().await;
    match service.load_feature(runtime.feature()).await {
        Ok(outcome) if outcome.affected => {
            service.install_alive_expect(
                runtime.feature(),
                &outcome.driver_name,
                super::lifecycle::AlivePolicy::Optional,
            );
        }
        Ok(_) => {}
        Err(err) => {
            warn!(
                service = service.name(),
                feature = runtime.feature(),
                error = %err,
                "cold reload request failed"
            );
        }
    }
}

/// `state:stopped`: a draining driver acknowledged the stop.
async fn handle_driver_stop(service: Arc<Service>, runtime: Arc<DriverRuntime>, _msg: Message) {
    if runtime.state() != DriverState::Stopped {
        runtime.set_state(DriverState::Stopped);
        if let Some(gate) = service.drain_gate() {
            gate.done_one();
        }
    }
}

/// `rpc:call`: forward to the target feature, stamping the caller.
async fn handle_rpc_call(service: Arc<Service>, from: Arc<DriverRuntime>, mut msg: Message) {
    msg.labels
        .insert(LABEL_CALLER.to_string(), from.feature().to_string());

    let Some(feature) = msg.label(LABEL_FEATURE).map(str::to_string) else {
        warn!(service = service.name(), "rpc call without a feature label");
        return;
    };
    let Some(target) = service.runtime(&feature) else {
        warn!(service = service.name(), feature, "rpc call to unloaded feature");
        return;
    };
    if let Err(err) = target.send_message(&msg).await {
        warn!(service = service.name(), feature, error = %err, "rpc forward failed");
    }
}

/// `rpc:return`: resolve locally or route back to the caller.
async fn handle_rpc_return(service: Arc<Service>, _from: Arc<DriverRuntime>, msg: Message) {
    match msg.label(LABEL_CALLER) {
        Some(NO_CALLER) => service.rpc_registry().handle_return(&msg),
        Some(caller) => {
            let Some(target) = service.runtime(caller) else {
                warn!(service = service.name(), caller, "rpc return to unloaded feature");
                return;
            };
            if let Err(err) = target.send_message(&msg).await {
                warn!(service = service.name(), caller, error = %err, "rpc return failed");
            }
        }
        None => warn!(service = service.name(), "rpc return without a caller label"),
    }
}

/// `broadcast:reload`: config refresh, or drain-and-exit when forced.
async fn handle_reload(service: Arc<Service>, _from: Arc<DriverRuntime>, mut msg: Message) {
    if let Some(target) = msg.label(LABEL_DAEMON_ID) {
        if target != service.daemon().id() {
            return;
        }
    }

    if let Err(err) = msg.deserialize_payload() {
        warn!(service = service.name(), error = %err, "undecodable reload payload");
        return;
    }
    let force = msg
        .value()
        .and_then(|v| v.get("force"))
        .is_some_and(truthy);

    if !force {
        if service.daemon().is_master(service.name()) {
            warn!(service = service.name(), "reloading config on broadcast");
            service.config().refresh();
        }
        return;
    }

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        warn!(service = service.name(), "quitting on forced reload broadcast");
        service.drain().await;
        if service.daemon().is_master(service.name()) {
            service.daemon().shutdown().await;
            std::process::exit(0);
        }
    });
}

/// `api:call`: route by the `fn` label to a registered handler.
async fn handle_api(service: Arc<Service>, _from: Arc<DriverRuntime>, mut msg: Message) {
    if let Err(err) = msg.deserialize_payload() {
        warn!(service = service.name(), error = %err, "undecodable api payload");
        return;
    }

    let Some(factory) = service.response_factory.read().clone() else {
        debug!(service = service.name(), "no response factory, skipping api call");
        return;
    };

    let eventbus = match service.receiver(FEATURE_EVENTBUS).await {
        Ok(runtime) => runtime.handler().stdin().clone(),
        Err(err) => {
            debug!(service = service.name(), error = %err, "api call without an eventbus");
            return;
        }
    };

    let Some(response) = factory.new_response(service.daemon().id(), eventbus, &msg) else {
        debug!(service = service.name(), labels = ?msg.labels, "skipping api call");
        return;
    };

    let Some(method) = msg.label(LABEL_FN).map(str::to_string) else {
        debug!(service = service.name(), "api call without an fn label");
        return;
    };
    let Some(handler) = service.apis.read().get(&method).cloned() else {
        debug!(service = service.name(), method, "unknown api method");
        return;
    };

    debug!(service = service.name(), method, "handling api call");
    let name = service.name().to_string();
    spawn_contained(service.name(), "api", async move {
        run_contained(&name, "api", move || (*handler)(response));
    });
}
