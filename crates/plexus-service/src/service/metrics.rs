//! Emitter-backed metrics.
//!
//! Metrics ride the message bus: fire-and-forget RPC to whichever
//! driver fills the `emitter` feature. No emitter, no metrics; the
//! supervisor never blocks on observability.

use super::{Service, FEATURE_EMITTER};
use plexus_driver::{DriverState, RpcCaller};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Counter: one inbound message, tagged by service/driver/direction/
/// channel/subject.
pub const METRIC_MESSAGE: &str = "plexus.daemon.local.message";
/// Gauge: driver runtimes by state.
pub const METRIC_DRIVERS: &str = "plexus.daemon.drivers";
/// Counter: one crash-recovery attempt.
pub const METRIC_RECOVERY: &str = "plexus.daemon.driver.recovery_attempt";

impl Service {
    /// Increments a counter on the emitter, without waiting.
    pub fn counter_incr(self: &Arc<Self>, name: &str, tags: Vec<String>) {
        let service = Arc::clone(self);
        let params = json!({"name": name, "tags": tags});
        tokio::spawn(async move {
            if let Err(err) = service
                .call_no_wait(FEATURE_EMITTER, "counter_increment", &params)
                .await
            {
                debug!(service = service.name(), error = %err, "counter emit failed");
            }
        });
    }

    /// Sets a gauge on the emitter, without waiting.
    pub fn gauge_set(self: &Arc<Self>, name: &str, value: String, tags: Vec<String>) {
        let service = Arc::clone(self);
        let params = json!({"name": name, "value": value, "tags": tags});
        tokio::spawn(async move {
            if let Err(err) = service
                .call_no_wait(FEATURE_EMITTER, "gauge_set", &params)
                .await
            {
                debug!(service = service.name(), error = %err, "gauge emit failed");
            }
        });
    }

    /// Periodic driver-state gauges plus the user metrics hook.
    ///
    /// Runs until daemon shutdown; emits only while the emitter
    /// feature is alive.
    pub(crate) async fn metrics_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.tunables().metrics_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of an interval is immediate.
        tick.tick().await;

        while !self.daemon().is_shutting_down() {
            let emitting = self
                .runtime(FEATURE_EMITTER)
                .is_some_and(|rt| rt.state() == DriverState::Alive);

            if emitting {
                let mut loading = 0usize;
                let mut alive = 0usize;
                let mut failed = 0usize;
                for runtime in self.runtimes() {
                    match runtime.state() {
                        DriverState::Loading => loading += 1,
                        DriverState::Alive => alive += 1,
                        DriverState::Failed => failed += 1,
                        DriverState::Reloading | DriverState::Stopped => {}
                    }
                }
                for (state, count) in [("loading", loading), ("alive", alive), ("failed", failed)]
                {
                    self.gauge_set(
                        METRIC_DRIVERS,
                        count.to_string(),
                        vec![format!("service:{}", self.name()), format!("state:{state}")],
                    );
                }
            }

            if let Some(hook) = self.emit_metrics.read().clone() {
                (*hook)(&self);
            }
            tick.tick().await;
        }
    }
}
