#![forbid(unsafe_code)]

//! `engine-supervisor-ctl`: local CLI companion for `engine-supervisor`.
//!
//! Connects to the IPC socket and sends one registry command per run.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "engine-supervisor-ctl",
    about = "Local CLI for engine-supervisor",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the supervisor's `ipc_name` config).
    #[arg(long, default_value = "engine-supervisor")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report whether an account's worker is ready.
    IsRunning {
        /// Account identifier.
        account_id: String,
    },

    /// Print the OS process id of an account's worker.
    Pid {
        /// Account identifier.
        account_id: String,
    },

    /// Start an account's worker.
    Start {
        /// Account identifier.
        account_id: String,
    },

    /// Stop an account's worker.
    Stop {
        /// Account identifier.
        account_id: String,
    },

    /// Stop every worker.
    StopAll,

    /// Restart an account's worker.
    Restart {
        /// Account identifier.
        account_id: String,
    },

    /// Stop an account's worker and delete its working and cache directories.
    Delete {
        /// Account identifier.
        account_id: String,
    },
}

impl Command {
    fn to_request(&self) -> serde_json::Value {
        let (method, account_id) = match self {
            Self::IsRunning { account_id } => ("isRunning", Some(account_id)),
            Self::Pid { account_id } => ("getProcessId", Some(account_id)),
            Self::Start { account_id } => ("start", Some(account_id)),
            Self::Stop { account_id } => ("stop", Some(account_id)),
            Self::StopAll => ("stopAll", None),
            Self::Restart { account_id } => ("restart", Some(account_id)),
            Self::Delete { account_id } => ("delete", Some(account_id)),
        };

        let mut request = serde_json::json!({ "method": method });
        if let Some(id) = account_id {
            request["accountId"] = serde_json::Value::String(id.clone());
        }
        request
    }
}

fn main() {
    let args = Cli::parse();
    let request_json = args.command.to_request();

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to supervisor: {err}");
            eprintln!(
                "Is engine-supervisor running with ipc_name '{}'?",
                args.ipc_name
            );
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
