//! Worker process spawner.
//!
//! Launches one engine worker per account with:
//! - `env_clear()` + a fixed allowlist so secrets held by the supervisor
//!   never reach tenant code.
//! - `ENGINE_ACCOUNT_ID` injected explicitly.
//! - The channel socket path passed as `--channel <path>`.
//! - The account's working directory as the current directory.
//! - `kill_on_drop(true)` so a dropped [`Child`] never outlives its handle.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::info;

use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Host variables copied verbatim into a worker's environment.
pub const ALLOWED_ENV_VARS: &[&str] = &["LANG", "PATH", "HOME", "SHELL", "ENGINE_PROXY"];

/// Host variable prefixes copied into a worker's environment (locale).
pub const ALLOWED_ENV_PREFIXES: &[&str] = &["LC_"];

/// Variable carrying the tenant's account id.
pub const ACCOUNT_ID_ENV: &str = "ENGINE_ACCOUNT_ID";

/// Command-line flag that names the channel socket.
pub const CHANNEL_ARG: &str = "--channel";

// ── Configuration ────────────────────────────────────────────────────────────

/// Parameters shared by every worker spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Worker executable.
    pub worker_command: String,
    /// Arguments passed before `--channel <path>`.
    pub worker_args: Vec<String>,
    /// Directory in which channel sockets are created.
    pub runtime_dir: PathBuf,
    /// Maximum time to wait for the worker's `ready` message.
    pub startup_timeout: Duration,
}

/// Whether a host variable may be passed to a worker.
#[must_use]
pub fn is_allowed_env(key: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&key)
        || ALLOWED_ENV_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
}

/// Filter `host` down to the allowlist and add the account id.
///
/// An `ENGINE_ACCOUNT_ID` already present in `host` is replaced.
pub fn sanitized_environment<I, K, V>(host: I, account_id: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env: BTreeMap<String, String> = host
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| is_allowed_env(k))
        .collect();
    env.insert(ACCOUNT_ID_ENV.to_owned(), account_id.to_owned());
    env
}

/// UTF-8 subset of the current process environment.
fn host_environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v): (OsString, OsString)| {
        Some((k.into_string().ok()?, v.into_string().ok()?))
    })
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Launch the worker for `account_id`.
///
/// The worker inherits stdout/stderr so its logs land next to the
/// supervisor's; stdin is closed. All protocol traffic uses the socket at
/// `channel_path`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the OS refuses to start the process.
pub fn spawn_worker(
    config: &SpawnConfig,
    account_id: &str,
    working_dir: &Path,
    channel_path: &Path,
) -> Result<Child> {
    let mut cmd = Command::new(&config.worker_command);
    cmd.args(&config.worker_args)
        .arg(CHANNEL_ARG)
        .arg(channel_path);

    cmd.env_clear();
    cmd.envs(sanitized_environment(host_environment(), account_id));

    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn worker '{}' for account {account_id}: {err}",
            config.worker_command
        ))
    })?;

    info!(
        account_id,
        pid = child.id(),
        command = %config.worker_command,
        "worker process spawned"
    );
    Ok(child)
}
