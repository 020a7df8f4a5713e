//! Multi-tenant engine supervisor.
//!
//! Runs one isolated worker process per account and bridges calls to the
//! engine hosted inside it over a dedicated Unix socket channel.
//!
//! - [`channel`]: framed duplex message stream over a worker's socket.
//! - [`rpc`]: calls and remote object references on top of a channel.
//! - [`orchestrator`]: worker process lifecycle and the tenant registry.
//! - [`host`]: the worker side of the bridge.

pub mod channel;
pub mod config;
pub mod errors;
pub mod host;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod rpc;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
