//! Service supervisor and message bus for the plexus daemon.
//!
//! A [`Service`] hosts a set of **features**, each filled by one
//! supervised driver subprocess, and multiplexes their framed stdio
//! streams into a single dispatch loop:
//!
//! ```text
//!  driver stdout ──► pump ──┐
//!  driver stdout ──► pump ──┤                ┌► expects      (one-shot)
//!  driver stdout ──► pump ──┼──► dispatch ───┼► responders   (control plane)
//!                 1s tick ──┘                ├► transformers (mutate/drop)
//!                                            └► router       (outbound sends)
//! ```
//!
//! The supervisor owns the driver lifecycle: feature resolution from
//! staged config, cold/hot reload decisions, crash recovery with
//! backoff, and graceful drain. Cross-feature RPC rides on the message
//! bus as `rpc:call`/`rpc:return` with a local correlation table.
//!
//! # Collaborators
//!
//! Configuration staging is external: anything implementing
//! [`ConfigProvider`] can drive the supervisor. [`StaticConfig`] is the
//! in-tree implementation over a JSON tree, used by `plexusd` and the
//! tests. API responses are built by an injected [`ResponseFactory`].
//!
//! # Process-wide state
//!
//! All registries live on [`Daemon`]: services, the master service,
//! and the emitter table. There are no module-level globals.

mod api;
mod config;
mod daemon;
mod error;
mod expect;
mod gate;
mod service;
mod task;
mod tunables;

pub use api::{AcceptAllResponses, ApiResponse, ResponseFactory};
pub use config::{staged_lookup, ConfigError, ConfigProvider, DecryptFn, Stage, StaticConfig};
pub use daemon::{local_ip, Daemon};
pub use error::ServiceError;
pub use service::{
    responder, transformer, ApiHandler, DiscoverHook, Responder, RoutedMessage, Router, Service,
    ServiceHook, Transformer, FEATURE_EMITTER, FEATURE_EVENTBUS, METRIC_DRIVERS, METRIC_MESSAGE,
    METRIC_RECOVERY,
};
pub use tunables::Tunables;

pub use plexus_driver::RpcCaller;
