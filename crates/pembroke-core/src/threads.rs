use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::messages::Direction;

const THREAD_COLUMNS: &str = "id, account_id, provider_thread_id, subject, snippet, last_message_at, message_count, is_unread, participants_json, created_at, updated_at";

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    From,
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    pub email: String,
    pub name: Option<String>,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: String,
    pub account_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub is_unread: bool,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("thread not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ThreadRepository {
    db: Database,
}

impl ThreadRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        account_id: &str,
        provider_thread_id: &str,
        subject: Option<String>,
        snippet: Option<String>,
    ) -> Result<Thread, ThreadError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO threads (id, account_id, provider_thread_id, subject, snippet, last_message_at, message_count, is_unread, participants_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, 0, '[]', ?6, ?6)
                     ON CONFLICT(account_id, provider_thread_id) DO UPDATE SET
                        subject = COALESCE(excluded.subject, threads.subject),
                        snippet = COALESCE(excluded.snippet, threads.snippet),
                        updated_at = excluded.updated_at
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![id, account_id, provider_thread_id, subject, snippet, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(provider_thread_id.to_string())),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Thread, ThreadError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_provider_id(
        &self,
        account_id: &str,
        provider_thread_id: &str,
    ) -> Result<Thread, ThreadError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads WHERE account_id = ?1 AND provider_thread_id = ?2"
                ),
                params![account_id, provider_thread_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(provider_thread_id.to_string())),
        }
    }

    /// Recompute the denormalized rollups from the messages table. Derived
    /// purely from stored rows, so re-applying a change set (redelivery,
    /// retry) converges to the same values regardless of arrival order.
    pub async fn refresh_rollups(&self, thread_id: &str) -> Result<Thread, ThreadError> {
        let conn = self.db.connection().await?;

        let mut rows = conn
            .query(
                "SELECT direction, from_email, from_name, to_json, cc_json, bcc_json, received_at
                 FROM messages WHERE thread_id = ?1
                 ORDER BY received_at, created_at",
                params![thread_id],
            )
            .await?;

        let mut count: i64 = 0;
        let mut last_message_at: Option<DateTime<Utc>> = None;
        let mut latest_is_incoming = false;
        let mut participants: BTreeSet<Participant> = BTreeSet::new();

        while let Some(row) = rows.next().await? {
            count += 1;
            let direction: String = row.get(0)?;
            let from_email: Option<String> = row.get(1)?;
            let from_name: Option<String> = row.get(2)?;
            let to_json: String = row.get(3)?;
            let cc_json: String = row.get(4)?;
            let bcc_json: String = row.get(5)?;
            let received_at: Option<String> = row.get(6)?;

            if let Some(raw) = received_at {
                let ts = DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc);
                if last_message_at.is_none_or(|current| ts >= current) {
                    last_message_at = Some(ts);
                    latest_is_incoming = direction == Direction::Incoming.as_str();
                }
            }

            if let Some(email) = from_email {
                participants.insert(Participant {
                    email: email.to_lowercase(),
                    name: from_name,
                    role: ParticipantRole::From,
                });
            }
            collect_participants(&mut participants, &to_json, ParticipantRole::To)?;
            collect_participants(&mut participants, &cc_json, ParticipantRole::Cc)?;
            collect_participants(&mut participants, &bcc_json, ParticipantRole::Bcc)?;
        }

        let participants: Vec<Participant> = participants.into_iter().collect();
        let participants_json = serde_json::to_string(&participants)?;
        let now = now_rfc3339();
        let last_message_at_str = last_message_at.map(to_rfc3339);

        let mut rows = conn
            .query(
                &format!(
                    "UPDATE threads
                     SET message_count = ?1,
                         last_message_at = ?2,
                         is_unread = ?3,
                         participants_json = ?4,
                         updated_at = ?5
                     WHERE id = ?6
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![
                    count,
                    last_message_at_str,
                    latest_is_incoming as i64,
                    participants_json,
                    now,
                    thread_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(thread_id.to_string())),
        }
    }
}

fn collect_participants(
    participants: &mut BTreeSet<Participant>,
    json: &str,
    role: ParticipantRole,
) -> Result<(), ThreadError> {
    let mailboxes: Vec<crate::messages::Mailbox> = serde_json::from_str(json)?;
    for mailbox in mailboxes {
        participants.insert(Participant {
            email: mailbox.email.to_lowercase(),
            name: mailbox.name,
            role: role.clone(),
        });
    }
    Ok(())
}

fn row_to_thread(row: Row) -> Result<Thread, ThreadError> {
    let last_message_at: Option<String> = row.get(5)?;
    let message_count: i64 = row.get(6)?;
    let is_unread: i64 = row.get(7)?;
    let participants_json: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Thread {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_thread_id: row.get(2)?,
        subject: row.get(3)?,
        snippet: row.get(4)?,
        last_message_at: match last_message_at {
            Some(value) => Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc)),
            None => None,
        },
        message_count,
        is_unread: is_unread != 0,
        participants: serde_json::from_str(&participants_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
