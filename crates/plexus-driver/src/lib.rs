//! Driver runtime: a supervised child process speaking the plexus
//! framed protocol over its stdio.
//!
//! # Lifecycle
//!
//! ```text
//!             start()                 state:alive
//! DriverSpec ────────► Loading ──────────────────► Alive
//!                                                 ╱  │  ╲
//!                            apply_hot() ◄───────╯   │   ╰──► Stopped
//!                                 │                  │     (command:stop acked)
//!                              Reloading ── alive ──►│
//!                                                    ▼
//!                                                  Failed
//!                                         (crash, write error, timeout)
//! ```
//!
//! A [`DriverSpec`] is only a descriptor; [`DriverRuntime::start`]
//! spawns the process, wires its stdout into the runtime's inbound
//! channel, forwards stderr to the process log and pushes the first
//! `command:options` snapshot. Identity is a fresh
//! [`RuntimeId`](plexus_types::RuntimeId) per start, which is what makes
//! cold reloads observable and hot reloads not.
//!
//! The [`rpc`] module provides call/return correlation over any driver
//! stream; the service supervisor implements [`RpcCaller`] on top of
//! its feature table.

mod error;
mod handler;
mod meta;
pub mod rpc;
mod runtime;
mod state;

pub use error::{DriverError, RpcError};
pub use handler::DriverHandler;
pub use meta::DriverMeta;
pub use rpc::{RpcCaller, RpcRegistry};
pub use runtime::{DriverRuntime, DriverSpec, INBOUND_BUFFER};
pub use state::DriverState;
