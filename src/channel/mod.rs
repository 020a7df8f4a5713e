//! Process channel adapter.
//!
//! Presents the dedicated Unix socket shared with one worker process as a
//! duplex message stream. The adapter frames and parses JSON lines but does
//! not interpret them; that is the RPC transport's job.
//!
//! Each channel owns a pair of tasks:
//! - `reader`: socket → inbound queue, including received OS handles.
//! - `writer`: outbound queue → socket, reporting each write's completion.

pub mod codec;
pub mod reader;
pub mod writer;

use std::os::fd::OwnedFd;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::writer::Outbound;
use crate::{AppError, Result};

/// Outbound writes queued ahead of the writer task.
const OUTBOUND_QUEUE: usize = 256;

/// Inbound messages buffered ahead of the consumer.
const INBOUND_QUEUE: usize = 256;

/// One message received from the peer.
#[derive(Debug)]
pub struct Inbound {
    /// Parsed JSON message.
    pub message: Value,
    /// OS handles that arrived with this message's bytes.
    pub handles: Vec<OwnedFd>,
}

/// Sending side of a process channel; cheap to clone.
///
/// Inbound messages are returned separately by [`ProcessChannel::open`] as
/// an [`mpsc::Receiver`]; its closure signals that the channel is gone.
#[derive(Debug, Clone)]
pub struct ProcessChannel {
    label: String,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl ProcessChannel {
    /// Wrap `stream` and start its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(label: &str, stream: UnixStream) -> (Self, mpsc::Receiver<Inbound>) {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let closed = CancellationToken::new();

        tokio::spawn(reader::run_reader(
            label.to_owned(),
            read_half,
            inbound_tx,
            closed.clone(),
        ));
        tokio::spawn(writer::run_writer(
            label.to_owned(),
            write_half,
            outbound_rx,
            closed.clone(),
        ));

        let channel = Self {
            label: label.to_owned(),
            outbound: outbound_tx,
            closed,
        };
        (channel, inbound_rx)
    }

    /// Label used in log output (normally the account id).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write one message; resolves once the socket accepted it.
    ///
    /// # Errors
    ///
    /// - [`AppError::ChannelClosed`] if the channel is already closed or
    ///   closes before the write happens.
    /// - [`AppError::Channel`] if the write itself fails.
    pub async fn send(&self, message: Value) -> Result<()> {
        self.enqueue(message, None).await
    }

    /// Write one message with an OS handle attached.
    ///
    /// The handle is closed in this process once transferred (or dropped if
    /// the write fails).
    ///
    /// # Errors
    ///
    /// Same as [`ProcessChannel::send`].
    pub async fn send_with_handle(&self, message: Value, handle: OwnedFd) -> Result<()> {
        self.enqueue(message, Some(handle)).await
    }

    /// Close the channel. Pending and future sends fail with
    /// [`AppError::ChannelClosed`]; the inbound queue ends.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the channel has been closed by either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn enqueue(&self, message: Value, handle: Option<OwnedFd>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::ChannelClosed);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let outbound = Outbound {
            message,
            handle,
            done: done_tx,
        };

        self.outbound
            .send(outbound)
            .await
            .map_err(|_| AppError::ChannelClosed)?;

        done_rx.await.map_err(|_| AppError::ChannelClosed)?
    }
}
