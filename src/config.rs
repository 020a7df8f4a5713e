//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::worker::TenantDirs;
use crate::orchestrator::spawner::SpawnConfig;
use crate::{AppError, Result};

/// Subdirectory of `data_root` holding the per-account directories.
const TENANTS_DIR: &str = "tenants";

fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("engine-supervisor")
}

fn default_worker_command() -> String {
    "engine-worker".into()
}

fn default_startup_timeout_seconds() -> u64 {
    30
}

fn default_ipc_name() -> String {
    "engine-supervisor".into()
}

fn default_accounts_db() -> PathBuf {
    PathBuf::from("accounts.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root holding the account store and the `tenants/` directory.
    pub data_root: PathBuf,
    /// Directory holding the per-worker channel sockets.
    ///
    /// Kept short: Unix socket paths are limited to ~100 bytes.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Worker binary launched once per account.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    /// Extra arguments passed to the worker before `--channel`.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Maximum time a worker may take to signal `ready`.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Delay applied before a restarted worker is spawned again.
    #[serde(default)]
    pub restart_delay_ms: u64,
    /// Named pipe / Unix socket identifier for the control surface.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// `SQLite` account store; relative paths resolve against `data_root`.
    #[serde(default = "default_accounts_db")]
    pub accounts_db: PathBuf,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration rooted at `data_root` with every other field
    /// at its default.
    #[must_use]
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            runtime_dir: default_runtime_dir(),
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            restart_delay_ms: 0,
            ipc_name: default_ipc_name(),
            accounts_db: default_accounts_db(),
        }
    }

    /// Maximum time a worker may take to signal `ready`.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Delay applied before a restarted worker is spawned.
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Resolved path of the account database.
    #[must_use]
    pub fn accounts_db_path(&self) -> PathBuf {
        if self.accounts_db.is_absolute() {
            self.accounts_db.clone()
        } else {
            self.data_root.join(&self.accounts_db)
        }
    }

    /// Directory holding one private directory per account.
    ///
    /// Kept apart from the account store so no account id can name it.
    #[must_use]
    pub fn tenants_root(&self) -> PathBuf {
        self.data_root.join(TENANTS_DIR)
    }

    /// Private working and cache directories of an account.
    ///
    /// Callers must validate `account_id` first; see
    /// [`validate_account_id`](crate::models::account::validate_account_id).
    #[must_use]
    pub fn tenant_dirs(&self, account_id: &str) -> TenantDirs {
        let working_dir = self.tenants_root().join(account_id);
        let cache_dir = working_dir.join("cache");
        TenantDirs {
            working_dir,
            cache_dir,
        }
    }

    /// Spawn parameters shared by every worker.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            worker_command: self.worker_command.clone(),
            worker_args: self.worker_args.clone(),
            runtime_dir: self.runtime_dir.clone(),
            startup_timeout: self.startup_timeout(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_command.trim().is_empty() {
            return Err(AppError::Config("worker_command must not be empty".into()));
        }

        if self.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "startup_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        if self.accounts_db_path().starts_with(self.tenants_root()) {
            return Err(AppError::Config(
                "accounts_db must not live inside the tenants directory".into(),
            ));
        }

        Ok(())
    }
}
