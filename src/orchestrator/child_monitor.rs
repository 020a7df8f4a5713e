//! Child process monitor: reaps a worker and reports how it exited.

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::worker::WorkerExit;

/// Own `child` until it exits, then call `on_exit` once.
///
/// Cancelling `kill` terminates the process; the task still waits for the
/// OS to reap it, but `on_exit` is not called (whoever cancelled has already
/// recorded the exit).
#[must_use]
pub fn monitor_exit<F>(
    account_id: String,
    mut child: Child,
    kill: CancellationToken,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(WorkerExit) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let exit = match result {
                    Ok(status) => WorkerExit::from_status(status),
                    Err(err) => {
                        warn!(account_id, %err, "error waiting for worker process");
                        WorkerExit::failed(format!("wait error: {err}"))
                    }
                };
                info!(account_id, code = ?exit.code, reason = %exit.reason, "worker process exited");
                on_exit(exit);
            }
            () = kill.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(account_id, %err, "failed to signal worker process");
                }
                match child.wait().await {
                    Ok(status) => info!(account_id, %status, "killed worker reaped"),
                    Err(err) => warn!(account_id, %err, "error reaping killed worker"),
                }
            }
        }
    })
}
