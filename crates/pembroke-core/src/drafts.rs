use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::ai::DraftContent;
use crate::db::{Database, DbError};
use crate::decisions::Decision;

const DRAFT_COLUMNS: &str = "id, decision_id, message_id, thread_id, subject, body_text, body_html, tone, version, is_sent, sent_at, created_at, updated_at";

/// A generated reply awaiting or following send. One lineage per decision;
/// `version` is strictly increasing and a sent draft is immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub id: String,
    pub decision_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub tone: String,
    pub version: i64,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One retained version of a draft's content, kept for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftRevision {
    pub id: String,
    pub draft_id: String,
    pub version: i64,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("draft not found: {0}")]
    NotFound(String),
    #[error("draft {0} was already sent and can no longer be revised")]
    DraftAlreadySent(String),
}

#[derive(Clone)]
pub struct DraftStore {
    db: Database,
}

impl DraftStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create version 1 for a decision, or return the existing lineage.
    /// Keyed by decision id so a retried pipeline run never forks a second
    /// draft.
    pub async fn create_or_get(
        &self,
        decision: &Decision,
        content: DraftContent,
    ) -> Result<(Draft, bool), DraftError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO drafts (id, decision_id, message_id, thread_id, subject, body_text, body_html, tone, version, is_sent, sent_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 0, NULL, ?9, ?9)
                 ON CONFLICT(decision_id) DO NOTHING",
                params![
                    id,
                    decision.id.clone(),
                    decision.message_id.clone(),
                    decision.thread_id.clone(),
                    content.subject.clone(),
                    content.body_text.clone(),
                    content.body_html.clone(),
                    content.tone,
                    now
                ],
            )
            .await?;

        let stored = self.get_by_decision(&decision.id).await?;
        // Keyed on (draft_id, version); duplicate inserts are no-ops.
        self.record_revision(&conn, &stored).await?;
        Ok((stored, inserted > 0))
    }

    /// Append a new version. Fails with `DraftAlreadySent` once the lineage
    /// is sent; every prior version's content stays in the revision history.
    pub async fn revise(
        &self,
        draft_id: &str,
        subject: Option<&str>,
        body_text: &str,
        body_html: Option<&str>,
    ) -> Result<Draft, DraftError> {
        let now = now_rfc3339();
        let subject = subject.map(str::to_string);
        let body_html = body_html.map(str::to_string);
        let conn = self.db.connection().await?;

        let mut rows = conn
            .query(
                &format!(
                    "UPDATE drafts
                     SET version = version + 1,
                         subject = COALESCE(?2, subject),
                         body_text = ?3,
                         body_html = ?4,
                         updated_at = ?5
                     WHERE id = ?1 AND is_sent = 0
                     RETURNING {DRAFT_COLUMNS}"
                ),
                params![draft_id, subject, body_text, body_html, now],
            )
            .await?;

        let revised = match rows.next().await? {
            Some(row) => row_to_draft(row)?,
            None => {
                // Distinguish "sent" from "missing" for the caller.
                let existing = self.get_by_id(draft_id).await?;
                if existing.is_sent {
                    return Err(DraftError::DraftAlreadySent(draft_id.to_string()));
                }
                return Err(DraftError::NotFound(draft_id.to_string()));
            }
        };

        self.record_revision(&conn, &revised).await?;
        Ok(revised)
    }

    /// Flip `is_sent`, at most once. Marking an already-sent draft again is a
    /// benign no-op so a retried send confirmation cannot fail.
    pub async fn mark_sent(&self, draft_id: &str) -> Result<Draft, DraftError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE drafts
                     SET is_sent = 1, sent_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND is_sent = 0
                     RETURNING {DRAFT_COLUMNS}"
                ),
                params![draft_id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_draft(row),
            None => {
                let existing = self.get_by_id(draft_id).await?;
                if existing.is_sent {
                    Ok(existing)
                } else {
                    Err(DraftError::NotFound(draft_id.to_string()))
                }
            }
        }
    }

    pub async fn get_by_id(&self, draft_id: &str) -> Result<Draft, DraftError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1"),
                params![draft_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_draft(row),
            None => Err(DraftError::NotFound(draft_id.to_string())),
        }
    }

    pub async fn get_by_decision(&self, decision_id: &str) -> Result<Draft, DraftError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE decision_id = ?1"),
                params![decision_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_draft(row),
            None => Err(DraftError::NotFound(decision_id.to_string())),
        }
    }

    pub async fn exists_for_decision(&self, decision_id: &str) -> Result<bool, DraftError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM drafts WHERE decision_id = ?1 LIMIT 1",
                params![decision_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Full version history for a lineage, oldest first.
    pub async fn history(&self, draft_id: &str) -> Result<Vec<DraftRevision>, DraftError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, draft_id, version, subject, body_text, body_html, created_at
                 FROM draft_revisions WHERE draft_id = ?1 ORDER BY version",
                params![draft_id],
            )
            .await?;

        let mut revisions = Vec::new();
        while let Some(row) = rows.next().await? {
            revisions.push(row_to_revision(row)?);
        }
        Ok(revisions)
    }

    async fn record_revision(
        &self,
        conn: &libsql::Connection,
        draft: &Draft,
    ) -> Result<(), DraftError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO draft_revisions (id, draft_id, version, subject, body_text, body_html, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(draft_id, version) DO NOTHING",
            params![
                id,
                draft.id.clone(),
                draft.version,
                draft.subject.clone(),
                draft.body_text.clone(),
                draft.body_html.clone(),
                now
            ],
        )
        .await?;
        Ok(())
    }
}

fn row_to_draft(row: Row) -> Result<Draft, DraftError> {
    let is_sent: i64 = row.get(9)?;
    let sent_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Draft {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        message_id: row.get(2)?,
        thread_id: row.get(3)?,
        subject: row.get(4)?,
        body_text: row.get(5)?,
        body_html: row.get(6)?,
        tone: row.get(7)?,
        version: row.get(8)?,
        is_sent: is_sent != 0,
        sent_at: match sent_at {
            Some(value) => Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc)),
            None => None,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn row_to_revision(row: Row) -> Result<DraftRevision, DraftError> {
    let created_at: String = row.get(6)?;
    Ok(DraftRevision {
        id: row.get(0)?,
        draft_id: row.get(1)?,
        version: row.get(2)?,
        subject: row.get(3)?,
        body_text: row.get(4)?,
        body_html: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
