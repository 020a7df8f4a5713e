//! Account model: the identity of one tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Longest account identifier accepted.
pub const MAX_ACCOUNT_ID_LEN: usize = 64;

/// A registered tenant whose engine runs in its own worker process.
///
/// Immutable for the lifetime of a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    /// Unique account identifier; also names the account's directories.
    pub id: String,
    /// Human-readable name shown by the front-end.
    pub display_name: String,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Construct a new account stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Reject identifiers that cannot safely name a directory under the data root.
///
/// Accepts ASCII letters, digits, `-`, `_` and `.`; rejects empty strings,
/// `.`/`..`, and anything longer than [`MAX_ACCOUNT_ID_LEN`].
///
/// # Errors
///
/// Returns `AppError::NotFound` naming the rejected identifier.
pub fn validate_account_id(id: &str) -> Result<()> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_ACCOUNT_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if well_formed {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("invalid account id '{id}'")))
    }
}
