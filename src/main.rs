//! `engine-supervisor`: multi-tenant engine supervisor binary.
//!
//! Loads configuration, opens the account store, starts one worker per
//! account, and serves the registry over the local IPC socket until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use engine_supervisor::config::GlobalConfig;
use engine_supervisor::ipc::server::spawn_ipc_server;
use engine_supervisor::models::account::Account;
use engine_supervisor::orchestrator::TenantRegistry;
use engine_supervisor::persistence::account_repo::AccountRepo;
use engine_supervisor::persistence::db;
use engine_supervisor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "engine-supervisor", about = "Multi-tenant engine supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the data root holding per-account directories.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Account maintenance; omit to run the supervisor.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an account in the account store.
    AddAccount {
        /// Account identifier; also names its directory.
        id: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
    },

    /// List registered accounts.
    ListAccounts,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("engine-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(data_root) = args.data_root {
        config.data_root = data_root;
    }
    std::fs::create_dir_all(&config.data_root)
        .map_err(|err| AppError::Config(format!("cannot create data root: {err}")))?;
    let config = Arc::new(config);
    info!(data_root = %config.data_root.display(), "configuration loaded");

    // ── Open account store ──────────────────────────────
    let db = Arc::new(db::connect(&config.accounts_db_path()).await?);
    let accounts = Arc::new(AccountRepo::new(db));
    info!("account store connected");

    if let Some(command) = args.command {
        return run_command(command, &accounts).await;
    }

    // ── Start tenants ───────────────────────────────────
    let registry = TenantRegistry::new(Arc::clone(&config), accounts);
    let summary = registry.start_all().await?;
    for (account_id, err) in &summary.failed {
        warn!(account_id, %err, "tenant left stopped");
    }

    // ── Control surface ─────────────────────────────────
    let ct = CancellationToken::new();
    let ipc_handle = spawn_ipc_server(registry.clone(), &config.ipc_name, ct.clone())?;
    info!(running = summary.started.len(), "engine-supervisor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    registry.stop_all();
    if let Err(err) = ipc_handle.await {
        error!(%err, "ipc server task failed");
    }
    info!("engine-supervisor shut down");

    Ok(())
}

async fn run_command(command: Command, accounts: &AccountRepo) -> Result<()> {
    match command {
        Command::AddAccount { id, name } => {
            let display_name = name.unwrap_or_else(|| id.clone());
            let account = accounts.insert(&Account::new(id, display_name)).await?;
            println!("registered {}", account.id);
        }
        Command::ListAccounts => {
            for account in accounts.list().await? {
                println!(
                    "{}\t{}\t{}",
                    account.id,
                    account.display_name,
                    account.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
