use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::db::{Database, DbError};

const AUDIT_COLUMNS: &str = "id, action, entity_type, entity_id, details_json, created_at";

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

/// Append-only audit sink. `record` is fire-and-forget so a slow or failing
/// audit write never blocks the pipeline; `record_now` is the awaitable
/// variant for tests and for callers that already run on a worker.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(
        &self,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        details: Value,
    ) {
        let log = self.clone();
        let action = action.into();
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        tokio::spawn(async move {
            if let Err(err) = log
                .record_now(&action, &entity_type, &entity_id, details)
                .await
            {
                warn!(action, entity_type, entity_id, error = %err, "audit write failed");
            }
        });
    }

    pub async fn record_now(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        details: Value,
    ) -> Result<(), AuditError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let details_json = serde_json::to_string(&details)?;

        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO audit_log (id, action, entity_type, entity_id, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, action, entity_type, entity_id, details_json, now],
        )
        .await?;
        Ok(())
    }

    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log
                     WHERE entity_type = ?1 AND entity_id = ?2
                     ORDER BY created_at"
                ),
                params![entity_type, entity_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: Row) -> Result<AuditRecord, AuditError> {
    let details_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(AuditRecord {
        id: row.get(0)?,
        action: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        details: serde_json::from_str(&details_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
