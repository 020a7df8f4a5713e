//! Channel writer task.
//!
//! Receives outbound messages from a tokio [`mpsc`] queue, serialises each
//! one to a single JSON line, and writes it to the socket. A message may
//! carry one OS handle; it is attached to the first byte of the line as
//! `SCM_RIGHTS` ancillary data.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// One queued write and the completion slot that reports its outcome.
#[derive(Debug)]
pub struct Outbound {
    /// Message to serialise.
    pub message: Value,
    /// Optional handle transferred together with the message.
    pub handle: Option<OwnedFd>,
    /// Resolved once the socket accepted (or refused) the write.
    pub done: oneshot::Sender<Result<()>>,
}

/// Writer task: drains `queue` until cancellation, queue closure, or the
/// first failed write.
///
/// A failed write cancels `closed`, which also stops the paired reader.
/// Writes still queued at that point are dropped; their senders observe
/// [`AppError::ChannelClosed`].
///
/// # Errors
///
/// Always returns `Ok(())`; failures are reported through each
/// [`Outbound::done`] slot.
pub async fn run_writer(
    label: String,
    mut stream: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!(channel = %label, "channel writer: closed, stopping");
                break;
            }

            item = queue.recv() => {
                let Some(outbound) = item else {
                    debug!(channel = %label, "channel writer: queue closed, stopping");
                    break;
                };

                let result = write_one(&mut stream, &outbound.message, outbound.handle.as_ref()).await;
                let failed = result.is_err();
                if let Err(ref err) = result {
                    warn!(channel = %label, %err, "channel writer: write failed");
                }

                // The sender may have given up waiting; that is not an error here.
                let _ = outbound.done.send(result);

                if failed {
                    closed.cancel();
                    break;
                }
            }
        }
    }

    closed.cancel();
    Ok(())
}

async fn write_one(
    stream: &mut OwnedWriteHalf,
    message: &Value,
    handle: Option<&OwnedFd>,
) -> Result<()> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| AppError::Channel(format!("failed to serialise outbound message: {e}")))?;
    bytes.push(b'\n');

    let written = match handle {
        None => 0,
        Some(fd) => send_with_handle(stream.as_ref(), &bytes, fd.as_raw_fd())
            .await
            .map_err(|e| AppError::Channel(format!("handle transfer failed: {e}")))?,
    };

    stream
        .write_all(&bytes[written..])
        .await
        .map_err(|e| AppError::Channel(format!("write failed: {e}")))
}

/// Send as much of `bytes` as the socket accepts in one `sendmsg`, with
/// `fd` attached. Returns the number of bytes written.
async fn send_with_handle(stream: &UnixStream, bytes: &[u8], fd: RawFd) -> io::Result<usize> {
    loop {
        stream.writable().await?;

        let attempt = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(bytes)];
            let fds = [fd];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg(
                stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None::<&UnixAddr>,
            )
            .map_err(io::Error::from)
        });

        match attempt {
            Ok(sent) => return Ok(sent),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
    }
}
