//! Persistence layer modules.

pub mod account_repo;
pub mod db;
pub mod schema;

use std::future::Future;
use std::pin::Pin;

use crate::models::account::Account;
use crate::Result;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Source of the accounts the registry may run.
///
/// Methods return boxed futures so the trait stays object-safe and can be
/// shared as `Arc<dyn AccountStore>`.
pub trait AccountStore: Send + Sync {
    /// Every registered account.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn list_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>>;

    /// One account by id, or `None` if it is not registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get_account<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Account>>> + Send + 'a>>;
}
