//! Channel reader task.
//!
//! Reads bytes (and any `SCM_RIGHTS` handles) from the socket with
//! `recvmsg`, frames them into lines with [`LineFramer`], parses each
//! line as JSON, and pushes the result onto the inbound queue.
//!
//! Handles are delivered with the message whose bytes they arrived with.
//! The sender attaches a handle to its own line, and the kernel ends a
//! read right after the segment carrying handles, so handles belong to the
//! line containing the last byte of the read that returned them.

use std::collections::VecDeque;
use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use serde_json::Value;
use tokio::io::Interest;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::codec::LineFramer;
use crate::channel::Inbound;
use crate::Result;

/// Bytes requested from the socket per `recvmsg` call.
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Most handles accepted in a single `recvmsg` call.
const MAX_HANDLES_PER_READ: usize = 8;

/// Reader task: runs until EOF, a socket error, or cancellation.
///
/// Oversized lines and lines that are not valid UTF-8 JSON are logged and
/// skipped; they do not close the channel.
/// On exit the task cancels `closed` and drops `inbound`, which is how the
/// consumer learns the channel is gone.
///
/// # Errors
///
/// Always returns `Ok(())`; socket failures end the task and close the
/// channel.
pub async fn run_reader(
    label: String,
    stream: OwnedReadHalf,
    inbound: mpsc::Sender<Inbound>,
    closed: CancellationToken,
) -> Result<()> {
    let mut framer = LineFramer::new();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    // Stream offset of `buffer[0]`.
    let mut consumed: usize = 0;
    let mut pending_handles: VecDeque<(usize, OwnedFd)> = VecDeque::new();

    'read: loop {
        let read = tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!(channel = %label, "channel reader: closed, stopping");
                break;
            }

            read = recv_chunk(stream.as_ref(), &mut chunk) => read,
        };

        let (len, handles) = match read {
            Ok((0, _)) => {
                debug!(channel = %label, "channel reader: EOF detected");
                break;
            }
            Ok(received) => received,
            Err(err) => {
                warn!(channel = %label, %err, "channel reader: socket error, stopping");
                break;
            }
        };

        // Stream offset of the last byte in this chunk.
        let offset = consumed + buffer.len() + len - 1;
        pending_handles.extend(handles.into_iter().map(|fd| (offset, fd)));
        buffer.extend_from_slice(&chunk[..len]);

        loop {
            let before = buffer.len();
            let decoded = framer.decode(&mut buffer);
            consumed += before - buffer.len();

            let line = match decoded {
                Ok(None) => break,
                Ok(Some(line)) => line,
                Err(err) => {
                    warn!(channel = %label, %err, "channel reader: framing error, skipping");
                    continue;
                }
            };

            let mut attached = Vec::new();
            while pending_handles.front().is_some_and(|(at, _)| *at < consumed) {
                if let Some((_, fd)) = pending_handles.pop_front() {
                    attached.push(fd);
                }
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let message: Value = match serde_json::from_slice(&line) {
                Ok(value) => value,
                Err(err) => {
                    let raw_line = String::from_utf8_lossy(&line);
                    warn!(channel = %label, %err, raw_line = %raw_line, "channel reader: malformed json, skipping");
                    continue;
                }
            };

            let item = Inbound {
                message,
                handles: attached,
            };
            if inbound.send(item).await.is_err() {
                debug!(channel = %label, "channel reader: consumer gone, stopping");
                break 'read;
            }
        }
    }

    closed.cancel();
    Ok(())
}

/// Receive one chunk of bytes plus any handles that came with it.
async fn recv_chunk(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    loop {
        stream.readable().await?;

        let attempt = stream.try_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_HANDLES_PER_READ]);
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            )?;

            let mut raw_fds = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    raw_fds.extend(fds);
                }
            }
            Ok((msg.bytes, raw_fds))
        });

        match attempt {
            Ok((len, raw_fds)) => return Ok((len, raw_fds.into_iter().map(adopt_fd).collect())),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
    }
}

/// Take ownership of a descriptor installed by `SCM_RIGHTS`.
#[allow(unsafe_code)]
fn adopt_fd(raw: RawFd) -> OwnedFd {
    // SAFETY: the kernel installed `raw` into this process's descriptor
    // table while delivering the SCM_RIGHTS message; nothing else refers
    // to it yet, so this is its sole owner.
    unsafe { OwnedFd::from_raw_fd(raw) }
}
