//! Local IPC layer for `engine-supervisor-ctl` and front-end interaction.
//!
//! Provides a Unix domain socket (named pipe on Windows) server that accepts
//! JSON-line registry commands.

pub mod server;
