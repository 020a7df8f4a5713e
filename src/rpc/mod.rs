//! Object-oriented RPC over process channels.

pub mod envelope;
pub mod object;
pub mod transport;

pub use envelope::{Envelope, RemoteRef};
pub use object::{arg, unknown_method, CallContext, InvokeFuture, ObjectTable, RemoteObject};
pub use transport::{RemoteHandle, RpcTransport, TransportEvent};
