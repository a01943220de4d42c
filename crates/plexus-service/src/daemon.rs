//! Process-wide daemon state.
//!
//! All registries that used to be process globals live on [`Daemon`]:
//! the service catalog, the master service and the emitter table. The
//! binary creates one `Arc<Daemon>` in `main` and threads it through.

use crate::service::Service;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Discovers the host's outbound IP address.
///
/// Connecting a UDP socket never sends a packet; it only asks the
/// kernel which local address would route there. Falls back to
/// loopback on hosts without a route.
#[must_use]
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Owner of every service in this process.
///
/// The first registered service becomes the **master**: it responds to
/// non-forced `broadcast:reload` by refreshing config and is the one
/// that shuts the whole daemon down on a forced reload.
pub struct Daemon {
    id: String,
    services: parking_lot::RwLock<HashMap<String, Arc<Service>>>,
    master: OnceLock<String>,
    emitters: parking_lot::RwLock<HashMap<String, Arc<Service>>>,
    shutting_down: AtomicBool,
}

impl Daemon {
    /// Creates a daemon identified by the host's outbound IP.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_id(local_ip())
    }

    /// Creates a daemon with an explicit identity.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            services: parking_lot::RwLock::new(HashMap::new()),
            master: OnceLock::new(),
            emitters: parking_lot::RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Stable identifier of this daemon instance, targeted by the
    /// `daemonID` label on broadcasts.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn register(&self, service: &Arc<Service>) {
        let _ = self.master.get_or_init(|| service.name().to_string());
        self.services
            .write()
            .insert(service.name().to_string(), Arc::clone(service));
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }

    /// All registered services.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().values().cloned().collect()
    }

    /// Whether the named service is the master.
    #[must_use]
    pub fn is_master(&self, name: &str) -> bool {
        self.master.get().is_some_and(|m| m.as_str() == name)
    }

    /// The master service, once one has registered.
    #[must_use]
    pub fn master(&self) -> Option<Arc<Service>> {
        self.master.get().and_then(|name| self.service(name))
    }

    /// The service whose `emitter` feature is alive for `service`,
    /// if any.
    #[must_use]
    pub fn emitter_for(&self, service: &str) -> Option<Arc<Service>> {
        self.emitters.read().get(service).cloned()
    }

    pub(crate) fn install_emitter(&self, service: &Arc<Service>) {
        self.emitters
            .write()
            .insert(service.name().to_string(), Arc::clone(service));
    }

    pub(crate) fn remove_emitter(&self, service: &str) {
        self.emitters.write().remove(service);
    }

    /// Whether [`shutdown`](Self::shutdown) has been initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops the daemon: flags every dispatch loop down and closes all
    /// driver runtimes.
    pub async fn shutdown(&self) {
        info!(daemon = self.id, "shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        for service in self.services() {
            service.close_runtimes().await;
        }
    }

    /// Unrecoverable failure: logs and exits the process.
    ///
    /// Used for boot failures of required features and exhausted crash
    /// recovery, where continuing would serve a half-alive daemon.
    pub fn fatal(&self, msg: &str) -> ! {
        error!(daemon = self.id, "{msg}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_yields_an_address() {
        let ip: std::net::IpAddr = local_ip().parse().unwrap();
        assert!(!ip.to_string().is_empty());
    }

    #[test]
    fn shutdown_flag_starts_clear() {
        let daemon = Daemon::with_id("test");
        assert!(!daemon.is_shutting_down());
        assert_eq!(daemon.id(), "test");
        assert!(daemon.master().is_none());
    }
}
