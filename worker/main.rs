//! `engine-worker`: per-tenant engine host process.
//!
//! Spawned by `engine-supervisor`, one per account. Connects to the channel
//! socket given by `--channel`, serves the bundled engine, and exits when
//! the supervisor closes the channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use engine_supervisor::host::engine::BasicEngineFactory;
use engine_supervisor::host::run_worker;
use engine_supervisor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "engine-worker", about = "Per-tenant engine host", version, long_about = None)]
struct Cli {
    /// Unix socket created by the supervisor for this worker.
    #[arg(long)]
    channel: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(async {
            info!(channel = %args.channel.display(), "engine worker starting");
            let result = run_worker(&args.channel, Arc::new(BasicEngineFactory)).await;
            if let Err(ref err) = result {
                error!(%err, "engine worker failed");
            }
            result
        })
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
