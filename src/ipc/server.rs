//! Local IPC server for `engine-supervisor-ctl` and the front-end.
//!
//! Listens on a Unix domain socket (or named pipe on Windows) using the
//! `interprocess` crate and maps line-delimited JSON requests onto
//! [`TenantRegistry`] operations.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"method": "start", "accountId": "alice"}
//! {"method": "getProcessId", "accountId": "alice"}
//! {"method": "stopAll"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not running: account alice"}
//! ```

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::orchestrator::TenantRegistry;
use crate::{AppError, Result};

/// Registry operation requested over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlMethod {
    /// Whether the account has a ready worker.
    IsRunning,
    /// OS process id of the account's worker.
    GetProcessId,
    /// Start the account's worker.
    Start,
    /// Stop the account's worker.
    Stop,
    /// Stop every worker.
    StopAll,
    /// Stop the account and remove its on-disk state.
    Delete,
    /// Stop then start the account's worker.
    Restart,
}

/// Inbound IPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcRequest {
    /// Operation to perform.
    pub method: ControlMethod,
    /// Target account; required by every method except `stopAll`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Outbound IPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    registry: TenantRegistry,
    ipc_name: &str,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ipc_name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, registry.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    registry: TenantRegistry,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_request(&registry, &request).await,
                        Err(err) => IpcResponse::error(format!("invalid request: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route one request to the registry.
pub async fn dispatch_request(registry: &TenantRegistry, request: &IpcRequest) -> IpcResponse {
    let span = info_span!("ipc_command", method = ?request.method);
    async move {
        if request.method == ControlMethod::StopAll {
            let stopped = registry.stop_all();
            return IpcResponse::success(json!({ "stopped": stopped }));
        }

        let Some(account_id) = request.account_id.as_deref() else {
            return IpcResponse::error("missing required 'accountId' field");
        };

        let outcome = match request.method {
            ControlMethod::IsRunning => Ok(json!({ "running": registry.is_running(account_id) })),
            ControlMethod::GetProcessId => Ok(json!({ "pid": registry.process_id(account_id) })),
            ControlMethod::Start => registry
                .start(account_id)
                .await
                .map(|_| json!({ "pid": registry.process_id(account_id) })),
            ControlMethod::Restart => registry
                .restart(account_id)
                .await
                .map(|_| json!({ "pid": registry.process_id(account_id) })),
            ControlMethod::Stop => Ok(json!({ "stopped": registry.stop(account_id) })),
            ControlMethod::Delete => registry
                .delete(account_id)
                .await
                .map(|()| json!({ "deleted": account_id })),
            ControlMethod::StopAll => Ok(Value::Null),
        };

        match outcome {
            Ok(data) => {
                info!(account_id, method = ?request.method, "ipc command completed");
                IpcResponse::success(data)
            }
            Err(err) => {
                warn!(account_id, method = ?request.method, %err, "ipc command failed");
                IpcResponse::error(err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}
