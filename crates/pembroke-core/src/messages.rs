use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const MESSAGE_COLUMNS: &str = "id, account_id, thread_id, provider_message_id, direction, from_email, from_name, to_json, cc_json, bcc_json, subject, snippet, body_plain, body_html, headers_json, attachments_json, received_at, created_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// A mail message. Immutable once stored; superseding state lives in the
/// associated classification, decision, and draft rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub thread_id: String,
    pub provider_message_id: String,
    pub direction: Direction,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub headers: Value,
    pub attachments: Vec<Attachment>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub account_id: String,
    pub thread_id: String,
    pub provider_message_id: String,
    pub direction: Direction,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub headers: Value,
    pub attachments: Vec<Attachment>,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid direction value {0}")]
    InvalidDirection(String),
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create-or-fetch-existing keyed by (account, provider message id).
    /// Messages are immutable, so a redelivered message never overwrites the
    /// stored row. Returns the stored message and whether this call created
    /// it.
    pub async fn create_or_get(
        &self,
        new_msg: NewMessage,
    ) -> Result<(Message, bool), MessageError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let to_json = serde_json::to_string(&new_msg.to)?;
        let cc_json = serde_json::to_string(&new_msg.cc)?;
        let bcc_json = serde_json::to_string(&new_msg.bcc)?;
        let headers_json = serde_json::to_string(&new_msg.headers)?;
        let attachments_json = serde_json::to_string(&new_msg.attachments)?;
        let received_at_str = new_msg.received_at.map(to_rfc3339);

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO messages (
                    id, account_id, thread_id, provider_message_id, direction, from_email, from_name, to_json, cc_json, bcc_json, subject, snippet, body_plain, body_html, headers_json, attachments_json, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(account_id, provider_message_id) DO NOTHING",
                params![
                    id,
                    new_msg.account_id.clone(),
                    new_msg.thread_id,
                    new_msg.provider_message_id.clone(),
                    new_msg.direction.as_str(),
                    new_msg.from_email,
                    new_msg.from_name,
                    to_json,
                    cc_json,
                    bcc_json,
                    new_msg.subject,
                    new_msg.snippet,
                    new_msg.body_plain,
                    new_msg.body_html,
                    headers_json,
                    attachments_json,
                    received_at_str,
                    now
                ],
            )
            .await?;

        let stored = self
            .get_by_provider_id(&new_msg.account_id, &new_msg.provider_message_id)
            .await?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_provider_id(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ?1 AND provider_message_id = ?2"
                ),
                params![account_id, provider_message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(provider_message_id.to_string())),
        }
    }

    pub async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY received_at, created_at"
                ),
                params![thread_id],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub async fn exists(
        &self,
        account_id: &str,
        provider_message_id: &str,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM messages WHERE account_id = ?1 AND provider_message_id = ?2 LIMIT 1",
                params![account_id, provider_message_id],
            )
            .await?;

        Ok(rows.next().await?.is_some())
    }
}

fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let direction_str: String = row.get(4)?;
    let to_json: String = row.get(7)?;
    let cc_json: String = row.get(8)?;
    let bcc_json: String = row.get(9)?;
    let headers_json: String = row.get(14)?;
    let attachments_json: String = row.get(15)?;
    let received_at: Option<String> = row.get(16)?;
    let created_at: String = row.get(17)?;

    let direction = Direction::from_str(&direction_str)
        .ok_or(MessageError::InvalidDirection(direction_str))?;

    Ok(Message {
        id: row.get(0)?,
        account_id: row.get(1)?,
        thread_id: row.get(2)?,
        provider_message_id: row.get(3)?,
        direction,
        from_email: row.get(5)?,
        from_name: row.get(6)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        subject: row.get(10)?,
        snippet: row.get(11)?,
        body_plain: row.get(12)?,
        body_html: row.get(13)?,
        headers: serde_json::from_str(&headers_json)?,
        attachments: serde_json::from_str(&attachments_json)?,
        received_at: match received_at {
            Some(value) => Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc)),
            None => None,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
