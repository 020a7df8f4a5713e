//! Request/response layer over a [`ProcessChannel`].
//!
//! Outgoing calls get a fresh correlation id and park a oneshot in the
//! pending map until the matching `result` or `error` arrives. Incoming
//! calls are dispatched to the local [`ObjectTable`] on their own task so a
//! slow method never blocks the reader. When the channel ends, every
//! pending call fails with [`AppError::Disconnected`] and the token from
//! [`RpcTransport::closed`] is cancelled.
//!
//! An exported object lives until the peer sends `release` for it or the
//! transport closes.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{Inbound, ProcessChannel};
use crate::rpc::envelope::{CallId, Envelope, ErrorPayload, ObjectId, RemoteRef};
use crate::rpc::object::{CallContext, ObjectTable, RemoteObject};
use crate::{AppError, Result};

/// Non-call traffic surfaced to the transport's owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// The peer announced its root object.
    Ready(RemoteRef),
    /// The peer transferred OS handles under a correlation id.
    Direct {
        /// Correlation id chosen by the sender.
        id: String,
        /// Handles that arrived with the message.
        handles: Vec<OwnedFd>,
    },
}

#[derive(Default)]
struct PendingCalls {
    /// Set once the transport is closed; new calls fail immediately.
    closed: Option<String>,
    calls: HashMap<CallId, oneshot::Sender<Result<Value>>>,
}

struct TransportInner {
    channel: ProcessChannel,
    objects: ObjectTable,
    pending: Mutex<PendingCalls>,
    next_call: AtomicU64,
    closed: CancellationToken,
}

/// RPC endpoint bound to one process channel; cheap to clone.
#[derive(Clone)]
pub struct RpcTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("channel", &self.inner.channel.label())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcTransport {
    /// Bind a transport to an open channel and start its dispatch task.
    ///
    /// Returns the transport and the stream of [`TransportEvent`]s.
    #[must_use]
    pub fn new(
        channel: ProcessChannel,
        inbound: mpsc::Receiver<Inbound>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = Self {
            inner: Arc::new(TransportInner {
                channel,
                objects: ObjectTable::new(),
                pending: Mutex::new(PendingCalls::default()),
                next_call: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::downgrade(&transport.inner), inbound, events_tx));
        (transport, events_rx)
    }

    /// Objects this side exposes to the peer.
    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.inner.objects
    }

    /// Export `object` and return its reference.
    #[must_use]
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> RemoteRef {
        self.inner.objects.export(object)
    }

    /// Callable handle for an object living in the peer.
    #[must_use]
    pub fn handle(&self, reference: RemoteRef) -> RemoteHandle {
        RemoteHandle {
            transport: self.clone(),
            reference,
        }
    }

    /// Channel label (normally the account id).
    #[must_use]
    pub fn label(&self) -> &str {
        self.inner.channel.label()
    }

    /// Whether [`close`](Self::close) ran or the channel ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed() || self.lock_pending().closed.is_some()
    }

    /// Token cancelled once the transport is closed locally or its inbound
    /// stream has been drained after the peer went away.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Calls still waiting for an answer.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.lock_pending().calls.len()
    }

    /// Invoke `method` on the peer object `target`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`] if the method itself failed.
    /// - [`AppError::Disconnected`] if the channel is closed or closes
    ///   before the answer arrives.
    pub async fn call(&self, target: RemoteRef, method: &str, args: Vec<Value>) -> Result<Value> {
        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if let Some(reason) = &pending.closed {
                return Err(AppError::Disconnected(reason.clone()));
            }
            pending.calls.insert(id, tx);
        }
        // Forget the call if the caller stops waiting.
        let _pending = PendingGuard {
            transport: self,
            id,
        };

        let envelope = Envelope::Call {
            id,
            target: target.id,
            method: method.to_owned(),
            args,
        };
        if let Err(err) = self.send_envelope(&envelope).await {
            return Err(match err {
                AppError::ChannelClosed => AppError::Disconnected(self.closed_reason()),
                other => other,
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Disconnected(self.closed_reason())),
        }
    }

    /// Announce `root` as this side's bootstrap object.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ChannelClosed`] if the channel is closed.
    pub async fn send_ready(&self, root: RemoteRef) -> Result<()> {
        self.send_envelope(&Envelope::Ready { root: root.id }).await
    }

    /// Transfer `handle` to the peer under `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ChannelClosed`] if the channel is closed, or
    /// [`AppError::Channel`] if the transfer fails.
    pub async fn send_direct(&self, correlation_id: &str, handle: OwnedFd) -> Result<()> {
        let envelope = Envelope::Direct {
            id: correlation_id.to_owned(),
        };
        let message = encode(&envelope)?;
        self.inner.channel.send_with_handle(message, handle).await
    }

    /// Tell the peer it may drop the object behind `target`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Disconnected`] if the channel is closed.
    pub async fn release(&self, target: RemoteRef) -> Result<()> {
        self.send_envelope(&Envelope::Release { target: target.id })
            .await
            .map_err(|err| match err {
                AppError::ChannelClosed => AppError::Disconnected(self.closed_reason()),
                other => other,
            })
    }

    /// Close the channel and fail every pending call with `reason`.
    pub fn close(&self, reason: &str) {
        self.fail_pending(reason);
        self.inner.channel.close();
        self.inner.objects.clear();
        self.inner.closed.cancel();
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.inner.channel.send(encode(envelope)?).await
    }

    fn complete(&self, id: CallId, result: Result<Value>) {
        let waiter = self.lock_pending().calls.remove(&id);
        match waiter {
            // The caller may have stopped waiting.
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(channel = %self.label(), call_id = id, "rpc: answer for unknown call"),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let calls = {
            let mut pending = self.lock_pending();
            if pending.closed.is_none() {
                pending.closed = Some(reason.to_owned());
            }
            std::mem::take(&mut pending.calls)
        };
        if !calls.is_empty() {
            debug!(channel = %self.label(), count = calls.len(), reason, "rpc: failing pending calls");
        }
        for (_, tx) in calls {
            let _ = tx.send(Err(AppError::Disconnected(reason.to_owned())));
        }
    }

    fn closed_reason(&self) -> String {
        self.lock_pending()
            .closed
            .clone()
            .unwrap_or_else(|| "channel closed".into())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a call's pending entry when its future completes or is dropped.
struct PendingGuard<'a> {
    transport: &'a RpcTransport,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.transport.lock_pending().calls.remove(&self.id);
    }
}

/// Callable reference to one object in the peer process.
///
/// Handles are plain references: dropping one does not free the remote
/// object. Call [`release`](Self::release) once no clone needs it.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    transport: RpcTransport,
    reference: RemoteRef,
}

impl RemoteHandle {
    /// Wire reference of the target object.
    #[must_use]
    pub fn reference(&self) -> RemoteRef {
        self.reference
    }

    /// Export a local object on the same channel, typically to pass it as
    /// a callback argument.
    #[must_use]
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> RemoteRef {
        self.transport.export(object)
    }

    /// Invoke `method` on the target object.
    ///
    /// # Errors
    ///
    /// See [`RpcTransport::call`].
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.transport.call(self.reference, method, args).await
    }

    /// Invoke `method` and decode its return value.
    ///
    /// # Errors
    ///
    /// See [`RpcTransport::call`]; a return value of the wrong shape is
    /// reported as [`AppError::Remote`].
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Remote(format!("{method}: unexpected return value: {e}")))
    }

    /// Let the peer drop the target object. Later calls through any clone
    /// of this handle fail with an unknown-object error.
    ///
    /// # Errors
    ///
    /// See [`RpcTransport::release`].
    pub async fn release(self) -> Result<()> {
        self.transport.release(self.reference).await
    }

    /// Invoke `method` and wrap the returned `{"$ref": ..}` as a handle.
    ///
    /// # Errors
    ///
    /// See [`RemoteHandle::call_as`].
    pub async fn call_remote(&self, method: &str, args: Vec<Value>) -> Result<Self> {
        let reference: RemoteRef = self.call_as(method, args).await?;
        Ok(self.transport.handle(reference))
    }
}

fn encode(envelope: &Envelope) -> Result<Value> {
    serde_json::to_value(envelope)
        .map_err(|e| AppError::Channel(format!("failed to encode envelope: {e}")))
}

/// Message text sent back to a caller whose call failed.
fn error_message(err: &AppError) -> String {
    match err {
        AppError::Remote(msg) => msg.clone(),
        other => other.to_string(),
    }
}

async fn dispatch(
    weak: Weak<TransportInner>,
    mut inbound: mpsc::Receiver<Inbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(Inbound { message, handles }) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let transport = RpcTransport { inner };

        let envelope: Envelope = match serde_json::from_value(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel = %transport.label(), %err, "rpc: unrecognised message, skipping");
                continue;
            }
        };

        match envelope {
            Envelope::Result { id, payload } => transport.complete(id, Ok(payload)),
            Envelope::Error { id, payload } => {
                transport.complete(id, Err(AppError::Remote(payload.message)));
            }
            Envelope::Call {
                id,
                target,
                method,
                args,
            } => {
                tokio::spawn(serve_call(transport, id, target, method, args));
            }
            Envelope::Ready { root } => {
                let _ = events.send(TransportEvent::Ready(RemoteRef::new(root)));
            }
            Envelope::Direct { id } => {
                let _ = events.send(TransportEvent::Direct { id, handles });
            }
            Envelope::Release { target } => {
                if !transport.objects().release(target) {
                    debug!(channel = %transport.label(), target, "rpc: release of unknown object");
                }
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        let transport = RpcTransport { inner };
        debug!(channel = %transport.label(), "rpc: inbound stream ended");
        transport.fail_pending("channel closed");
        transport.inner.channel.close();
        transport.inner.closed.cancel();
    }
}

async fn serve_call(
    transport: RpcTransport,
    id: CallId,
    target: ObjectId,
    method: String,
    args: Vec<Value>,
) {
    let reply = match transport.objects().get(target) {
        None => Err(AppError::Remote(format!("unknown object {target}"))),
        Some(object) => {
            let ctx = CallContext::new(transport.clone());
            let result = object.invoke(&ctx, &method, args).await;
            if let Err(ref err) = result {
                debug!(channel = %transport.label(), interface = object.interface(), method = %method, %err, "rpc: call failed");
            }
            result
        }
    };

    let envelope = match reply {
        Ok(payload) => Envelope::Result { id, payload },
        Err(err) => Envelope::Error {
            id,
            payload: ErrorPayload {
                message: error_message(&err),
            },
        },
    };

    if let Err(err) = transport.send_envelope(&envelope).await {
        debug!(channel = %transport.label(), call_id = id, %err, "rpc: reply dropped");
    }
}
