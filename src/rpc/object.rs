//! Remotely callable objects.
//!
//! Every type reachable over a channel implements [`RemoteObject`]; its
//! `invoke` match is the complete, compile-time list of methods the peer may
//! call. Objects are exported into an [`ObjectTable`], which hands out the
//! [`RemoteRef`] the peer uses to address them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::envelope::{ObjectId, RemoteRef};
use crate::rpc::transport::{RemoteHandle, RpcTransport};
use crate::{AppError, Result};

/// Boxed future returned by [`RemoteObject::invoke`].
pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// An object whose methods can be called from the peer process.
pub trait RemoteObject: Send + Sync {
    /// Interface name used in logs and error messages.
    fn interface(&self) -> &'static str;

    /// Invoke `method` with positional `args`.
    ///
    /// Implementations match on `method` and return
    /// [`unknown_method`] for anything they do not expose.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as a remote error carrying its
    /// display text.
    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a>;
}

/// Per-call context handed to [`RemoteObject::invoke`].
#[derive(Debug, Clone)]
pub struct CallContext {
    transport: RpcTransport,
}

impl CallContext {
    pub(crate) fn new(transport: RpcTransport) -> Self {
        Self { transport }
    }

    /// Export `object` so it can be returned to the caller as a reference.
    #[must_use]
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> RemoteRef {
        self.transport.objects().export(object)
    }

    /// Callable handle for a reference the caller passed in.
    #[must_use]
    pub fn remote(&self, reference: RemoteRef) -> RemoteHandle {
        self.transport.handle(reference)
    }

    /// Transport the call arrived on.
    #[must_use]
    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }
}

#[derive(Default)]
struct TableInner {
    next_id: ObjectId,
    objects: HashMap<ObjectId, Arc<dyn RemoteObject>>,
}

/// Objects this process exposes on one channel.
#[derive(Clone, Default)]
pub struct ObjectTable {
    inner: Arc<Mutex<TableInner>>,
}

impl std::fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTable")
            .field("len", &self.len())
            .finish()
    }
}

impl ObjectTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` and return the reference addressing it.
    #[must_use]
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> RemoteRef {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.objects.insert(id, object);
        RemoteRef::new(id)
    }

    /// Look up an exported object.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<Arc<dyn RemoteObject>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.objects.get(&id).cloned()
    }

    /// Drop an exported object; returns whether it was present.
    pub fn release(&self, id: ObjectId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.objects.remove(&id).is_some()
    }

    /// Number of exported objects.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.objects.len()
    }

    /// Whether nothing is exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every exported object.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.objects.clear();
    }
}

/// Decode positional argument `index` of `method`.
///
/// A missing argument decodes from `null`, so `Option<T>` parameters may be
/// omitted by the caller.
///
/// # Errors
///
/// Returns `AppError::Remote` naming the method and argument position.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize, method: &str) -> Result<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| AppError::Remote(format!("{method}: invalid argument {index}: {e}")))
}

/// Error returned for a method an interface does not expose.
#[must_use]
pub fn unknown_method(interface: &str, method: &str) -> AppError {
    AppError::Remote(format!("unknown method {interface}.{method}"))
}
