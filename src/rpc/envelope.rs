//! Wire envelope exchanged between the supervisor and its workers.
//!
//! | `type`   | Direction         | Fields                             |
//! |----------|-------------------|------------------------------------|
//! | `ready`  | worker → host     | `root`                             |
//! | `call`   | either            | `id`, `target`, `method`, `args`   |
//! | `result` | either            | `id`, `payload`                    |
//! | `error`  | either            | `id`, `payload.message`            |
//! | `direct` | host → worker     | `id` (handle rides as ancillary)   |
//! | `release`| either            | `target`                           |

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id linking a `call` to its `result` or `error`.
pub type CallId = u64;

/// Identifier of an exported object in the peer's object table.
pub type ObjectId = u64;

/// Opaque reference to an object living in the peer process.
///
/// Serialised as `{"$ref": <id>}` so it can appear anywhere inside call
/// arguments or return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Object id in the exporting process.
    #[serde(rename = "$ref")]
    pub id: ObjectId,
}

impl RemoteRef {
    /// Wrap a raw object id.
    #[must_use]
    pub fn new(id: ObjectId) -> Self {
        Self { id }
    }
}

/// Error description carried by an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Message reported by the failing method.
    pub message: String,
}

/// One message on a process channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// The worker finished booting; `root` is its bootstrap object.
    Ready {
        /// Root object id.
        root: ObjectId,
    },
    /// Invoke `method` on the object `target`.
    Call {
        /// Correlation id chosen by the caller.
        id: CallId,
        /// Target object id in the receiver's object table.
        target: ObjectId,
        /// Method name.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Successful completion of call `id`.
    Result {
        /// Correlation id of the answered call.
        id: CallId,
        /// Return value.
        #[serde(default)]
        payload: Value,
    },
    /// Failed completion of call `id`.
    Error {
        /// Correlation id of the answered call.
        id: CallId,
        /// Error description.
        payload: ErrorPayload,
    },
    /// An OS handle is attached to this message.
    Direct {
        /// Caller-chosen correlation id for the transferred resource.
        id: String,
    },
    /// The sender no longer references `target`; the receiver may drop it.
    Release {
        /// Object id in the receiver's object table.
        target: ObjectId,
    },
}
