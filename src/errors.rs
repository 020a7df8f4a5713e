//! Error types shared across the supervisor and the worker host.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// The enum is `Clone` so that a single in-flight start can hand the same
/// failure to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Control-socket communication failure.
    Ipc(String),
    /// The worker process could not be created.
    Spawn(String),
    /// The worker exited or errored before signaling `ready`.
    Handshake(String),
    /// Transport-level send/receive failure on a process channel.
    Channel(String),
    /// The process channel is closed; no further messages can be sent.
    ChannelClosed,
    /// The called method raised an error inside the remote process.
    Remote(String),
    /// The connection dropped before a remote call was answered.
    Disconnected(String),
    /// No live worker exists for the account.
    NotRunning(String),
    /// A live worker already exists for the account.
    AlreadyRunning(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AppError {
    /// Whether this error is a remote-call failure of the `disconnected` kind.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::ChannelClosed => write!(f, "channel: closed"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::Disconnected(msg) => write!(f, "remote: disconnected: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
