//! Feature resolution, load/reload decisions, boot and reload
//! staging, and crash recovery.

use super::{Service, FEATURE_EMITTER, METRIC_RECOVERY};
use crate::config::{DecryptFn, Stage};
use crate::error::ServiceError;
use crate::expect::ExpectHandler;
use plexus_driver::{DriverMeta, DriverRuntime, DriverSpec, DriverState, RpcCaller};
use plexus_wire::{CHANNEL_STATE, SUBJECT_ALIVE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix marking features that name their driver directly.
const DRIVER_FEATURE_PREFIX: &str = "driver:";

/// Outcome of one feature load pass.
pub(crate) struct LoadOutcome {
    /// Whether a runtime was started or reconfigured.
    pub affected: bool,
    /// The driver resolved for the feature.
    pub driver_name: String,
}

/// What a reload pass should do to a feature slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReloadAction {
    /// Nothing changed.
    Noop,
    /// Same process, new data: push options in place.
    Hot,
    /// Start a new process and replace the slot.
    Cold,
}

/// Pure reload decision.
pub(crate) fn decide(old_running: bool, meta_unchanged: bool, data_unchanged: bool) -> ReloadAction {
    match (old_running && meta_unchanged, data_unchanged) {
        (false, _) => ReloadAction::Cold,
        (true, false) => ReloadAction::Hot,
        (true, true) => ReloadAction::Noop,
    }
}

/// How an alive-expect timeout is handled.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AlivePolicy {
    /// Required feature at boot: failure is fatal to the process.
    RequiredBoot,
    /// Required feature at reload: mark failed and roll config back.
    RequiredReload,
    /// Optional feature: mark failed and carry on.
    Optional,
}

/// Loose truthiness over config values, for flags like `required` and
/// `force`.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl Service {
    /// Merges `daemon.features.global` and `daemon.features.<service>`
    /// into a feature → required map.
    pub(crate) fn feature_list(&self) -> HashMap<String, bool> {
        let mut features = HashMap::new();
        for scope in ["global", self.name()] {
            let Some(Value::Array(entries)) =
                self.config().staged_data(&format!("daemon.features.{scope}"))
            else {
                continue;
            };
            for entry in &entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    warn!(service = self.name(), ?entry, "feature entry without a name");
                    continue;
                };
                let required = entry.get("required").is_some_and(truthy);
                features.insert(name.to_string(), required);
            }
        }
        debug!(service = self.name(), ?features, "preliminary feature list");
        features
    }

    /// Maps a feature to its driver name.
    ///
    /// `driver:<name>` features name the driver directly; anything else
    /// goes through `daemon.featureMap.<service>.<feature>` with a
    /// global fallback.
    pub(crate) fn resolve_driver_name(&self, feature: &str) -> Result<String, ServiceError> {
        if let Some(name) = feature.strip_prefix(DRIVER_FEATURE_PREFIX) {
            return Ok(name.to_string());
        }
        self.config()
            .staged_str(&format!("daemon.featureMap.{}.{feature}", self.name()))
            .or_else(|| {
                self.config()
                    .staged_str(&format!("daemon.featureMap.global.{feature}"))
            })
            .ok_or_else(|| ServiceError::FeatureUnresolved(feature.to_string()))
    }

    /// Loads or reloads one feature from staged config.
    ///
    /// Builds the new spec, compares it with the installed runtime and
    /// performs the hot or cold reload it calls for. A failure marks
    /// the existing slot `Failed` so dispatch stops selecting it.
    pub(crate) async fn load_feature(
        self: &Arc<Self>,
        feature: &str,
    ) -> Result<LoadOutcome, ServiceError> {
        match self.load_feature_inner(feature).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(
                    service = self.name(),
                    feature,
                    error = %err,
                    "skip reloading feature"
                );
                if let Some(runtime) = self.runtime(feature) {
                    runtime.set_state(DriverState::Failed);
                }
                Err(err)
            }
        }
    }

    async fn load_feature_inner(
        self: &Arc<Self>,
        feature: &str,
    ) -> Result<LoadOutcome, ServiceError> {
        let old = self.runtime(feature);
        info!(
            service = self.name(),
            feature,
            reload = old.is_some(),
            "loading feature"
        );

        let driver_name = self.resolve_driver_name(feature)?;
        let data = self.config().staged_data(&driver_name);
        let dynamic_data = feature
            .starts_with(DRIVER_FEATURE_PREFIX)
            .then(|| self.dynamic_data_for(feature))
            .flatten();

        let meta_value = self
            .config()
            .staged_data(&format!("daemon.drivers.{driver_name}"))
            .ok_or_else(|| ServiceError::MetaMissing(driver_name.clone()))?;
        let meta = DriverMeta::from_value(&meta_value)?;
        debug!(service = self.name(), feature, driver = %meta.name, "resolved driver");

        let spec = DriverSpec::new(feature, meta, data, dynamic_data);

        let action = match &old {
            None => ReloadAction::Cold,
            Some(old) => decide(
                old.state() != DriverState::Failed,
                old.handler().meta() == &spec.meta,
                old.data() == spec.data && old.dynamic_data() == spec.dynamic_data,
            ),
        };

        match action {
            ReloadAction::Noop => {
                info!(service = self.name(), driver = driver_name, "driver not affected");
                Ok(LoadOutcome {
                    affected: false,
                    driver_name,
                })
            }
            ReloadAction::Hot => {
                let old = old.ok_or_else(|| ServiceError::FeatureNotLoaded(feature.into()))?;
                old.apply_hot(spec.data, spec.dynamic_data);
                old.send_options().await?;
                Ok(LoadOutcome {
                    affected: true,
                    driver_name,
                })
            }
            ReloadAction::Cold => {
                self.cold_reload(spec).await?;
                Ok(LoadOutcome {
                    affected: true,
                    driver_name,
                })
            }
        }
    }

    /// Starts a new runtime and installs it, retiring any predecessor
    /// after the graceful drain window.
    async fn cold_reload(self: &Arc<Self>, spec: DriverSpec) -> Result<(), ServiceError> {
        let runtime = DriverRuntime::start(spec, self.name()).await?;
        self.attach_pump(&runtime);
        let replaced = self.install_runtime(runtime.feature(), Arc::clone(&runtime));

        // Reap the child when it exits; only clear the slot if this
        // incarnation still owns it.
        {
            let service = Arc::clone(self);
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                runtime.handler().wait().await;
                service.check_delete_runtime(runtime.feature(), runtime.id());
                runtime.close().await;
            });
        }

        if let Some(old) = replaced {
            if old.feature() == FEATURE_EMITTER {
                self.daemon().remove_emitter(self.name());
            }
            // Retired, not crashed: keep it out of the recovery path.
            old.set_state(DriverState::Stopped);
            let grace = self.tunables().graceful_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                old.close().await;
            });
        }
        Ok(())
    }

    /// Arms the `state:alive:<driver>` expect that completes a load.
    ///
    /// The handler promotes the slot to `Alive` (and registers the
    /// emitter); the timeout applies `policy`.
    pub(crate) fn install_alive_expect(
        self: &Arc<Self>,
        feature: &str,
        driver_name: &str,
        policy: AlivePolicy,
    ) {
        let key = format!("{CHANNEL_STATE}:{SUBJECT_ALIVE}:{driver_name}");

        let handler: ExpectHandler = {
            let service = Arc::clone(self);
            let feature = feature.to_string();
            Arc::new(move |_msg| {
                if let Some(runtime) = service.runtime(&feature) {
                    runtime.set_state(DriverState::Alive);
                    if feature == FEATURE_EMITTER {
                        service.daemon().install_emitter(&service);
                    }
                }
            })
        };

        let on_timeout: Box<dyn FnOnce() + Send> = {
            let service = Arc::clone(self);
            let feature = feature.to_string();
            let driver = driver_name.to_string();
            Box::new(move || {
                let fail_slot = |svc: &Arc<Service>| {
                    if let Some(runtime) = svc.runtime(&feature) {
                        runtime.set_state(DriverState::Failed);
                    }
                };
                match policy {
                    AlivePolicy::RequiredBoot => {
                        service
                            .daemon()
                            .fatal(&format!("failed to start driver {}.{driver}", service.name()));
                    }
                    AlivePolicy::RequiredReload => {
                        warn!(service = service.name(), driver, "failed to reload driver");
                        fail_slot(&service);
                        service.config().roll_back();
                    }
                    AlivePolicy::Optional => {
                        warn!(
                            service = service.name(),
                            driver, "failed to start or reload driver"
                        );
                        fail_slot(&service);
                    }
                }
            })
        };

        self.expects()
            .add(self.name(), &key, handler, self.tunables().ready_timeout, on_timeout);
    }

    /// Loads every required feature, arming alive expects for the
    /// affected ones.
    ///
    /// At boot a load error is fatal; at reload it aborts the pass so
    /// the caller can roll back.
    async fn load_required(
        self: &Arc<Self>,
        features: &HashMap<String, bool>,
        boot: bool,
    ) -> Result<(), ServiceError> {
        for (feature, _) in features.iter().filter(|(_, required)| **required) {
            let outcome = match self.load_feature(feature).await {
                Ok(outcome) => outcome,
                Err(err) if boot => {
                    self.daemon().fatal(&format!(
                        "[{}] failed to load required feature {feature}: {err}",
                        self.name()
                    ));
                }
                Err(err) => return Err(err),
            };
            if outcome.affected {
                let policy = if boot {
                    AlivePolicy::RequiredBoot
                } else {
                    AlivePolicy::RequiredReload
                };
                self.install_alive_expect(feature, &outcome.driver_name, policy);
            }
        }
        Ok(())
    }

    /// Discovers dynamic features and loads every optional one.
    ///
    /// Optional load errors are warnings; the feature list is extended
    /// with discovered entries, which are never required.
    async fn load_additional(self: &Arc<Self>, features: &mut HashMap<String, bool>) {
        let hook = self.discover_features.read().clone();
        if let Some(discover) = hook {
            let dynamic = (*discover)(&self.config().staged_set());
            for name in dynamic.keys() {
                features.entry(name.clone()).or_insert(false);
            }
            self.set_dynamic_feature_data(dynamic);
        }
        debug!(service = self.name(), ?features, "final feature list");

        for (feature, _) in features.iter().filter(|(_, required)| !**required) {
            match self.load_feature(feature).await {
                Err(err) => {
                    warn!(service = self.name(), feature, error = %err, "skip feature");
                }
                Ok(outcome) if outcome.affected => {
                    self.install_alive_expect(feature, &outcome.driver_name, AlivePolicy::Optional);
                }
                Ok(_) => {}
            }
        }
    }

    /// Retires runtimes whose features are gone from the new list.
    fn remove_unused(self: &Arc<Self>, features: &HashMap<String, bool>) {
        let stale: Vec<String> = self
            .runtimes()
            .iter()
            .map(|rt| rt.feature().to_string())
            .filter(|feature| !features.contains_key(feature))
            .collect();

        for feature in stale {
            if feature == FEATURE_EMITTER {
                self.daemon().remove_emitter(self.name());
            }
            if let Some(runtime) = self.remove_runtime(&feature) {
                info!(service = self.name(), feature, "removing unused feature");
                runtime.set_state(DriverState::Stopped);
                let grace = self.tunables().graceful_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    runtime.close().await;
                });
            }
        }
    }

    /// Starts the service: spawns the boot sequence and returns.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            info!(service = service.name(), "starting service");
            if let Err(err) = service.boot().await {
                service
                    .daemon()
                    .fatal(&format!("[{}] boot failed: {err}", service.name()));
            }
        });
    }

    /// Walks the boot staging sequence to `Serving`.
    pub async fn boot(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.config().advance_stage(self.name(), Stage::Booting, None)?;
        let mut features = self.feature_list();
        self.load_required(&features, true).await?;

        tokio::spawn(Arc::clone(self).dispatch_loop());
        tokio::time::sleep(self.tunables().boot_settle).await;

        self.config()
            .advance_stage(self.name(), Stage::Discovering, Some(self.decrypt_fn()))?;
        self.load_additional(&mut features).await;
        self.config().advance_stage(self.name(), Stage::Serving, None)?;

        if let Some(hook) = self.service_reload.read().clone() {
            (*hook)(self);
        }
        self.set_healthy(true);
        tokio::spawn(Arc::clone(self).metrics_loop());
        Ok(())
    }

    /// Reloads the service against freshly staged configuration.
    ///
    /// On failure the service goes unhealthy and the config is rolled
    /// back, unless the failure is the rollback sentinel, meaning the
    /// revert was initiated outside the service.
    pub async fn reload(self: &Arc<Self>) {
        info!(service = self.name(), "reloading service");
        if let Err(err) = self.try_reload().await {
            self.set_healthy(false);
            if matches!(
                err,
                ServiceError::Config(crate::config::ConfigError::Rollback)
            ) {
                warn!(
                    service = self.name(),
                    "reverting config initiated outside of the service"
                );
                return;
            }
            warn!(service = self.name(), error = %err, "reverting config due to fatal failure");
            self.config().roll_back();
        }
    }

    async fn try_reload(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.config().advance_stage(self.name(), Stage::Booting, None)?;
        let mut features = self.feature_list();
        self.load_required(&features, false).await?;
        self.config()
            .advance_stage(self.name(), Stage::Discovering, Some(self.decrypt_fn()))?;
        self.load_additional(&mut features).await;
        self.config().advance_stage(self.name(), Stage::Serving, None)?;

        if let Some(hook) = self.service_reload.read().clone() {
            (*hook)(self);
        }
        self.set_healthy(true);
        self.remove_unused(&features);
        Ok(())
    }

    /// Crash recovery for a runtime that was `Alive`.
    ///
    /// Retries the feature load with backoff; every attempt bumps the
    /// recovery counter. Exhausting the budget is fatal: a daemon that
    /// cannot keep a driver alive is not serving.
    pub(crate) async fn recover_runtime(self: Arc<Self>, runtime: Arc<DriverRuntime>) {
        let feature = runtime.feature().to_string();
        let driver = runtime.driver_name().to_string();
        runtime.set_state(DriverState::Failed);

        for attempt in 0..=self.tunables().retry_count {
            self.counter_incr(
                METRIC_RECOVERY,
                vec![
                    format!("service:{}", self.name()),
                    format!("driver:{driver}"),
                ],
            );
            warn!(
                service = self.name(),
                driver, attempt, "reloading crashed driver"
            );

            match self.load_feature(&feature).await {
                Ok(outcome) => {
                    if outcome.affected {
                        self.install_alive_expect(&feature, &outcome.driver_name, AlivePolicy::Optional);
                    }
                    if let Some(fresh) = self.runtime(&feature) {
                        if fresh.ready(self.tunables().ready_timeout).await.is_ok() {
                            info!(service = self.name(), driver, "driver recovered");
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(service = self.name(), driver, error = %err, "driver reload attempt failed");
                }
            }
            // Back off only when another attempt follows; an exhausted
            // budget exits immediately.
            if attempt < self.tunables().retry_count {
                tokio::time::sleep(self.tunables().retry_backoff).await;
            }
        }

        self.daemon().fatal(&format!(
            "[{}] giving up on crashed driver {driver}",
            self.name()
        ));
    }

    /// Secret-decryption hook for the staging engine: RPC to the
    /// scheme's driver feature.
    #[must_use]
    pub fn decrypt_fn(self: &Arc<Self>) -> DecryptFn {
        let service = Arc::clone(self);
        Arc::new(move |scheme: String, ciphertext: Vec<u8>| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                service
                    .call_raw(&format!("driver:{scheme}"), "decrypt", ciphertext)
                    .await
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_matrix() {
        // No old runtime / failed old runtime: always cold.
        assert_eq!(decide(false, false, false), ReloadAction::Cold);
        assert_eq!(decide(false, true, true), ReloadAction::Cold);
        // Meta changed under a running driver: cold.
        assert_eq!(decide(true, false, true), ReloadAction::Cold);
        assert_eq!(decide(true, false, false), ReloadAction::Cold);
        // Same meta, new data: hot.
        assert_eq!(decide(true, true, false), ReloadAction::Hot);
        // Nothing changed: leave it alone.
        assert_eq!(decide(true, true, true), ReloadAction::Noop);
    }

    #[test]
    fn truthy_covers_config_shapes() {
        use serde_json::json;
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!("false")));
        assert!(!truthy(&json!(null)));
    }
}
