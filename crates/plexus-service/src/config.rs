//! Configuration collaborator interface.
//!
//! The supervisor consumes staged configuration but never loads or
//! parses configuration sources itself; that is the staging engine's
//! business. [`ConfigProvider`] is the seam, [`StaticConfig`] the
//! in-tree implementation over a plain JSON tree used by `plexusd`
//! and the test suite.

use plexus_driver::RpcError;
use plexus_types::ErrorCode;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Stages a service walks while booting, reloading or draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Loading required features.
    Booting,
    /// Required features up; discovery hooks may run.
    Discovering,
    /// All features loaded, serving traffic.
    Serving,
    /// Drained; no further traffic expected.
    Drained,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Booting => "booting",
            Self::Discovering => "discovering",
            Self::Serving => "serving",
            Self::Drained => "drained",
        })
    }
}

/// Secret-decryption hook handed to the staging engine at the
/// `Discovering` stage; built on driver RPC by the service.
pub type DecryptFn = Arc<
    dyn Fn(String, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>
        + Send
        + Sync,
>;

/// Failure reported by the config collaborator.
///
/// [`ConfigError::Rollback`] is a sentinel: a reload that fails with it
/// was reverted from outside the service, so the service must not roll
/// back again.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Staged config was rolled back externally.
    #[error("config rolled back outside of the service")]
    Rollback,

    /// Any other staging failure.
    #[error("config staging failed: {0}")]
    Failed(String),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Rollback => "CONFIG_ROLLBACK",
            Self::Failed(_) => "CONFIG_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Rollback)
    }
}

/// Staged-configuration surface the supervisor consumes.
pub trait ConfigProvider: Send + Sync {
    /// Looks up a dot-separated path in the staged driver dataset
    /// (e.g. `daemon.featureMap.global.eventbus`).
    fn staged_data(&self, path: &str) -> Option<Value>;

    /// [`staged_data`](Self::staged_data) narrowed to a string value.
    fn staged_str(&self, path: &str) -> Option<String> {
        self.staged_data(path)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// The whole staged dataset, for feature-discovery hooks.
    fn staged_set(&self) -> Value;

    /// Moves a service to the given stage.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Rollback`] when the staged dataset was reverted
    /// externally, or any other staging failure.
    fn advance_stage(
        &self,
        service: &str,
        stage: Stage,
        decrypt: Option<DecryptFn>,
    ) -> Result<(), ConfigError>;

    /// Reverts to the last good configuration.
    fn roll_back(&self);

    /// Re-fetches configuration sources in the background.
    fn refresh(&self);
}

/// Walks a dot-separated path through a JSON object tree.
#[must_use]
pub fn staged_lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut node = root;
    for key in path.split('.') {
        node = node.as_object()?.get(key)?;
    }
    Some(node)
}

/// [`ConfigProvider`] over a fixed JSON tree.
///
/// Stage transitions are recorded, rollbacks and refreshes counted;
/// the staged tree can be swapped to exercise reload paths. There is
/// no staging logic here; `Drained` after `Serving` is as legal as
/// anything else, matching a permissive external staging engine.
#[derive(Default)]
pub struct StaticConfig {
    staged: parking_lot::RwLock<Value>,
    stages: parking_lot::Mutex<HashMap<String, Stage>>,
    rollbacks: AtomicUsize,
    refreshes: AtomicUsize,
}

impl StaticConfig {
    /// Wraps a staged dataset.
    #[must_use]
    pub fn new(staged: Value) -> Self {
        Self {
            staged: parking_lot::RwLock::new(staged),
            ..Self::default()
        }
    }

    /// Replaces the staged dataset (a new "staged generation").
    pub fn set_staged(&self, staged: Value) {
        *self.staged.write() = staged;
    }

    /// The stage a service was last advanced to.
    #[must_use]
    pub fn stage_of(&self, service: &str) -> Option<Stage> {
        self.stages.lock().get(service).copied()
    }

    /// Number of [`roll_back`](ConfigProvider::roll_back) calls.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of [`refresh`](ConfigProvider::refresh) calls.
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl ConfigProvider for StaticConfig {
    fn staged_data(&self, path: &str) -> Option<Value> {
        staged_lookup(&self.staged.read(), path).cloned()
    }

    fn staged_set(&self) -> Value {
        self.staged.read().clone()
    }

    fn advance_stage(
        &self,
        service: &str,
        stage: Stage,
        _decrypt: Option<DecryptFn>,
    ) -> Result<(), ConfigError> {
        self.stages.lock().insert(service.to_string(), stage);
        Ok(())
    }

    fn roll_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}
