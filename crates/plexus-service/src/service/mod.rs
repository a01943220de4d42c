//! The service supervisor.
//!
//! Split across three impl files:
//!
//! - `mod.rs`: the [`Service`] struct, registration surface and the
//!   feature/runtime table
//! - `lifecycle.rs`: feature resolution, load/reload decisions, boot
//!   and reload staging, crash recovery
//! - `dispatch.rs`: the fan-in dispatch loop, the built-in control
//!   plane responders, and drain
//! - `metrics.rs`: emitter-backed counters and gauges

mod dispatch;
mod lifecycle;
mod metrics;

pub use metrics::{METRIC_DRIVERS, METRIC_MESSAGE, METRIC_RECOVERY};

use crate::api::ResponseFactory;
use crate::config::ConfigProvider;
use crate::daemon::Daemon;
use crate::error::ServiceError;
use crate::expect::ExpectTable;
use crate::gate::DrainGate;
use crate::tunables::Tunables;
use dispatch::ServiceEvent;
use plexus_driver::{DriverRuntime, RpcCaller, RpcError, RpcRegistry};
use plexus_types::RuntimeId;
use plexus_wire::{Message, MessageWriter};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Feature filled by the metrics emitter driver.
pub const FEATURE_EMITTER: &str = "emitter";
/// Feature filled by the eventbus driver, used as the API reply channel.
pub const FEATURE_EVENTBUS: &str = "eventbus";

/// Capacity of the unified dispatch channel.
const EVENT_BUFFER: usize = 256;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Persistent handler for a `channel:subject` key; may fire many times,
/// each invocation on its own detached task.
pub type Responder = Arc<dyn Fn(Arc<Service>, Arc<DriverRuntime>, Message) -> BoxFuture + Send + Sync>;

/// Message mutator for a `channel:subject` key; returning `None` drops
/// the message before routing.
pub type Transformer = Arc<dyn Fn(&Arc<DriverRuntime>, Message) -> Option<Message> + Send + Sync>;

/// Produces outbound addressed messages from an inbound message.
pub type Router = Arc<dyn Fn(&Message) -> Vec<RoutedMessage> + Send + Sync>;

/// Handler for one registered API method.
pub type ApiHandler = Arc<dyn Fn(crate::api::ApiResponse) + Send + Sync>;

/// Hook producing dynamic features from the staged dataset.
pub type DiscoverHook = Arc<dyn Fn(&Value) -> HashMap<String, Value> + Send + Sync>;

/// Hook invoked with the service (reload notification, metrics).
pub type ServiceHook = Arc<dyn Fn(&Arc<Service>) + Send + Sync>;

/// A message paired with the runtime it should be sent to.
pub struct RoutedMessage {
    /// Destination runtime.
    pub runtime: Arc<DriverRuntime>,
    /// Message to deliver.
    pub message: Message,
}

/// Wraps an async closure as a [`Responder`].
pub fn responder<F, Fut>(f: F) -> Responder
where
    F: Fn(Arc<Service>, Arc<DriverRuntime>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |svc, runtime, msg| Box::pin(f(svc, runtime, msg)))
}

/// Wraps a closure as a [`Transformer`].
pub fn transformer<F>(f: F) -> Transformer
where
    F: Fn(&Arc<DriverRuntime>, Message) -> Option<Message> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A coherent set of features sharing one dispatch loop and lifecycle.
pub struct Service {
    name: String,
    daemon: Arc<Daemon>,
    config: Arc<dyn ConfigProvider>,
    tunables: Tunables,

    runtimes: parking_lot::RwLock<HashMap<String, Arc<DriverRuntime>>>,
    dynamic_feature_data: parking_lot::Mutex<HashMap<String, Value>>,

    responders: parking_lot::RwLock<HashMap<String, Vec<Responder>>>,
    transformers: parking_lot::RwLock<HashMap<String, Vec<Transformer>>>,
    router: parking_lot::RwLock<Option<Router>>,
    apis: parking_lot::RwLock<HashMap<String, ApiHandler>>,
    response_factory: parking_lot::RwLock<Option<Arc<dyn ResponseFactory>>>,

    discover_features: parking_lot::RwLock<Option<DiscoverHook>>,
    service_reload: parking_lot::RwLock<Option<ServiceHook>>,
    emit_metrics: parking_lot::RwLock<Option<ServiceHook>>,

    expects: Arc<ExpectTable>,
    rpc: RpcRegistry,
    healthy: AtomicBool,
    draining: parking_lot::Mutex<Option<DrainGate>>,

    events_tx: mpsc::Sender<ServiceEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::Receiver<ServiceEvent>>>,
}

impl Service {
    /// Creates a service and registers it with the daemon.
    ///
    /// The first service created in a process becomes the daemon's
    /// master. The responder table is seeded with the fixed control
    /// plane (`state:cold`, `state:stopped`, `rpc:call`, `rpc:return`,
    /// `broadcast:reload`, `api:call`) and is append-only afterwards.
    #[must_use]
    pub fn new(
        daemon: &Arc<Daemon>,
        config: Arc<dyn ConfigProvider>,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_tunables(daemon, config, name, Tunables::default())
    }

    /// [`new`](Self::new) with explicit timing knobs.
    #[must_use]
    pub fn with_tunables(
        daemon: &Arc<Daemon>,
        config: Arc<dyn ConfigProvider>,
        name: impl Into<String>,
        tunables: Tunables,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let rpc = RpcRegistry::new(tunables.rpc_timeout);

        let service = Arc::new(Self {
            name: name.into(),
            daemon: Arc::clone(daemon),
            config,
            tunables,
            runtimes: parking_lot::RwLock::new(HashMap::new()),
            dynamic_feature_data: parking_lot::Mutex::new(HashMap::new()),
            responders: parking_lot::RwLock::new(HashMap::new()),
            transformers: parking_lot::RwLock::new(HashMap::new()),
            router: parking_lot::RwLock::new(None),
            apis: parking_lot::RwLock::new(HashMap::new()),
            response_factory: parking_lot::RwLock::new(None),
            discover_features: parking_lot::RwLock::new(None),
            service_reload: parking_lot::RwLock::new(None),
            emit_metrics: parking_lot::RwLock::new(None),
            expects: ExpectTable::new(),
            rpc,
            healthy: AtomicBool::new(false),
            draining: parking_lot::Mutex::new(None),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
        });

        dispatch::install_control_plane(&service);
        daemon.register(&service);
        service
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning daemon.
    #[must_use]
    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Config collaborator.
    #[must_use]
    pub fn config(&self) -> &Arc<dyn ConfigProvider> {
        &self.config
    }

    /// Timing knobs.
    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Health flag, for an external health endpoint.
    #[must_use]
    pub fn check_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    // --- registration surface (append-only after construction) ---

    /// Appends a responder for `channel:subject`.
    pub fn add_responder(&self, channel: &str, subject: &str, responder: Responder) {
        self.responders
            .write()
            .entry(format!("{channel}:{subject}"))
            .or_default()
            .push(responder);
    }

    /// Appends a transformer for `channel:subject`.
    pub fn add_transformer(&self, channel: &str, subject: &str, transformer: Transformer) {
        self.transformers
            .write()
            .entry(format!("{channel}:{subject}"))
            .or_default()
            .push(transformer);
    }

    /// Installs the router.
    pub fn set_router(&self, router: Router) {
        *self.router.write() = Some(router);
    }

    /// Registers an API method handler.
    pub fn register_api(&self, name: impl Into<String>, handler: ApiHandler) {
        self.apis.write().insert(name.into(), handler);
    }

    /// Injects the API response factory.
    pub fn set_response_factory(&self, factory: Arc<dyn ResponseFactory>) {
        *self.response_factory.write() = Some(factory);
    }

    /// Installs the dynamic feature discovery hook.
    pub fn set_discover_features(&self, hook: DiscoverHook) {
        *self.discover_features.write() = Some(hook);
    }

    /// Installs the post-reload hook.
    pub fn set_service_reload(&self, hook: ServiceHook) {
        *self.service_reload.write() = Some(hook);
    }

    /// Installs the extra metrics hook, invoked by the metrics loop.
    pub fn set_emit_metrics(&self, hook: ServiceHook) {
        *self.emit_metrics.write() = Some(hook);
    }

    // --- feature/runtime table ---

    /// The runtime currently filling a feature slot.
    #[must_use]
    pub fn runtime(&self, feature: &str) -> Option<Arc<DriverRuntime>> {
        self.runtimes.read().get(feature).cloned()
    }

    /// Snapshot of all installed runtimes.
    #[must_use]
    pub fn runtimes(&self) -> Vec<Arc<DriverRuntime>> {
        self.runtimes.read().values().cloned().collect()
    }

    /// The runtime for a feature, ready-waited.
    ///
    /// # Errors
    ///
    /// [`ServiceError::FeatureNotLoaded`] when the slot is empty, or
    /// the ready-timeout error.
    pub async fn receiver(&self, feature: &str) -> Result<Arc<DriverRuntime>, ServiceError> {
        let runtime = self
            .runtime(feature)
            .ok_or_else(|| ServiceError::FeatureNotLoaded(feature.to_string()))?;
        runtime.ready(self.tunables.ready_timeout).await?;
        Ok(runtime)
    }

    /// Installs a runtime in its feature slot, returning the one it
    /// replaced.
    pub(crate) fn install_runtime(
        &self,
        feature: &str,
        runtime: Arc<DriverRuntime>,
    ) -> Option<Arc<DriverRuntime>> {
        self.runtimes.write().insert(feature.to_string(), runtime)
    }

    /// Removes a feature slot only while the given incarnation still
    /// occupies it.
    pub(crate) fn check_delete_runtime(&self, feature: &str, id: RuntimeId) {
        let mut runtimes = self.runtimes.write();
        if runtimes.get(feature).is_some_and(|rt| rt.id() == id) {
            runtimes.remove(feature);
        }
    }

    /// Removes a feature slot unconditionally.
    pub(crate) fn remove_runtime(&self, feature: &str) -> Option<Arc<DriverRuntime>> {
        self.runtimes.write().remove(feature)
    }

    /// Closes every runtime; used at dispatch-loop exit and daemon
    /// shutdown.
    pub(crate) async fn close_runtimes(&self) {
        for runtime in self.runtimes() {
            runtime.close().await;
        }
    }

    pub(crate) fn expects(&self) -> &Arc<ExpectTable> {
        &self.expects
    }

    pub(crate) fn events_tx(&self) -> mpsc::Sender<ServiceEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn take_events_rx(&self) -> Option<mpsc::Receiver<ServiceEvent>> {
        self.events_rx.lock().take()
    }

    pub(crate) fn drain_gate(&self) -> Option<DrainGate> {
        self.draining.lock().clone()
    }

    pub(crate) fn set_drain_gate(&self, gate: Option<DrainGate>) {
        *self.draining.lock() = gate;
    }

    pub(crate) fn set_dynamic_feature_data(&self, data: HashMap<String, Value>) {
        *self.dynamic_feature_data.lock() = data;
    }

    pub(crate) fn dynamic_data_for(&self, feature: &str) -> Option<Value> {
        self.dynamic_feature_data.lock().get(feature).cloned()
    }
}

impl RpcCaller for Service {
    fn rpc_registry(&self) -> &RpcRegistry {
        &self.rpc
    }

    fn rpc_stream(&self, feature: &str) -> Result<MessageWriter, RpcError> {
        self.runtime(feature)
            .map(|rt| rt.handler().stdin().clone())
            .ok_or_else(|| RpcError::FeatureUnavailable(feature.to_string()))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("healthy", &self.check_health())
            .field("features", &self.runtimes.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
