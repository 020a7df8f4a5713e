//! Account repository for `SQLite` persistence.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;

use crate::models::account::{validate_account_id, Account};
use crate::{AppError, Result};

use super::db::Database;
use super::AccountStore;

/// Repository for registered accounts.
#[derive(Clone)]
pub struct AccountRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    display_name: String,
    created_at: String,
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Account {
            id: self.id,
            display_name: self.display_name,
            created_at,
        })
    }
}

impl AccountRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a new account.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an identifier that cannot name a
    /// directory, or `AppError::Db` if the insert fails (including a
    /// duplicate id).
    pub async fn insert(&self, account: &Account) -> Result<Account> {
        validate_account_id(&account.id)?;

        sqlx::query(
            "INSERT INTO account (id, display_name, created_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(&account.id)
        .bind(&account.display_name)
        .bind(account.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(account.clone())
    }

    /// Fetch an account by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, display_name, created_at FROM account WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(AccountRow::into_account).transpose()
    }

    /// List every registered account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT id, display_name, created_at FROM account ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(AccountRow::into_account).collect()
    }

    /// Remove an account record. Returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM account WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl AccountStore for AccountRepo {
    fn list_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        Box::pin(self.list())
    }

    fn get_account<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Account>>> + Send + 'a>> {
        Box::pin(self.get_by_id(id))
    }
}
