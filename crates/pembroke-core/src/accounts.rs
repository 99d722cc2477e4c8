use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const ACCOUNT_COLUMNS: &str =
    "id, provider, email, display_name, state_json, created_at, updated_at";

/// Tracks where an account sits in the sync lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Incremental sync from the stored cursor is working.
    #[default]
    Normal,
    /// The provider reported the cursor stale; a full resync is queued.
    NeedsResync,
    /// A full resync is in progress.
    Resyncing,
    /// Push watch lapsed or renewal failed; poll ticks drive sync.
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountState {
    /// Opaque incremental-sync watermark. Only moves forward; cleared only by
    /// an explicit full-resync reset.
    pub history_cursor: Option<String>,
    /// Deadline after which provider push notifications stop arriving.
    pub watch_expiry: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub provider: String,
    pub email: String,
    pub display_name: Option<String>,
    pub state: AccountState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("cursor for account {account_id} would move backwards: {current} -> {proposed}")]
    CursorRegression {
        account_id: String,
        current: String,
        proposed: String,
    },
}

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
}

impl AccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        email: impl Into<String>,
        display_name: Option<String>,
    ) -> Result<Account, AccountError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let state = AccountState::default();
        let state_json = serde_json::to_string(&state)?;
        let provider = "gmail";

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO accounts (id, provider, email, display_name, state_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![id, provider, email.into(), display_name, state_json, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| AccountError::NotFound("insert failed".into()))?;
        row_to_account(row)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1"),
                params![email],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(email.to_string())),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Account>, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at"),
                (),
            )
            .await?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await? {
            accounts.push(row_to_account(row)?);
        }
        Ok(accounts)
    }

    pub async fn update_state(
        &self,
        id: &str,
        state: &AccountState,
    ) -> Result<Account, AccountError> {
        let now = now_rfc3339();
        let state_json = serde_json::to_string(state)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE accounts
                     SET state_json = ?1, updated_at = ?2
                     WHERE id = ?3
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![state_json, now, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    /// Move the incremental cursor forward after a change set has been fully
    /// applied. Numeric cursors are compared so the watermark never regresses;
    /// use `reset_cursor` for the explicit full-resync override.
    pub async fn advance_cursor(
        &self,
        id: &str,
        new_cursor: &str,
    ) -> Result<Account, AccountError> {
        let account = self.get_by_id(id).await?;
        if let Some(current) = account.state.history_cursor.as_deref() {
            if cursor_regresses(current, new_cursor) {
                return Err(AccountError::CursorRegression {
                    account_id: id.to_string(),
                    current: current.to_string(),
                    proposed: new_cursor.to_string(),
                });
            }
        }

        let mut state = account.state.clone();
        state.history_cursor = Some(new_cursor.to_string());
        state.last_sync_at = Some(Utc::now());
        self.update_state(id, &state).await
    }

    /// Full-resync override: replace the cursor with the provider's current
    /// watermark and return the account to normal incremental sync.
    pub async fn reset_cursor(&self, id: &str, new_cursor: &str) -> Result<Account, AccountError> {
        let account = self.get_by_id(id).await?;
        let mut state = account.state.clone();
        state.history_cursor = Some(new_cursor.to_string());
        state.last_sync_at = Some(Utc::now());
        state.sync_status = SyncStatus::Normal;
        self.update_state(id, &state).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM accounts WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }
}

/// Provider watermarks are numeric in practice; when both sides parse, a
/// smaller value is a regression. Truly opaque cursors are accepted as-is.
fn cursor_regresses(current: &str, proposed: &str) -> bool {
    match (current.parse::<u64>(), proposed.parse::<u64>()) {
        (Ok(current), Ok(proposed)) => proposed < current,
        _ => false,
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_account(row: Row) -> Result<Account, AccountError> {
    let state_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Account {
        id: row.get(0)?,
        provider: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        state: serde_json::from_str(&state_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
