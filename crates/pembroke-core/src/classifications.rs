use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const CLASSIFICATION_COLUMNS: &str = "id, message_id, category, urgency, safe_to_reply, confidence, reasoning, model_used, tokens_used, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sales,
    Support,
    Personal,
    Legal,
    Spam,
    Newsletter,
    Transactional,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sales => "sales",
            Category::Support => "support",
            Category::Personal => "personal",
            Category::Legal => "legal",
            Category::Spam => "spam",
            Category::Newsletter => "newsletter",
            Category::Transactional => "transactional",
            Category::Other => "other",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sales" => Some(Self::Sales),
            "support" => Some(Self::Support),
            "personal" => Some(Self::Personal),
            "legal" => Some(Self::Legal),
            "spam" => Some(Self::Spam),
            "newsletter" => Some(Self::Newsletter),
            "transactional" => Some(Self::Transactional),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// AI judgment about one message. One per message, immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub id: String,
    pub message_id: String,
    pub category: Category,
    pub urgency: Urgency,
    pub safe_to_reply: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub model_used: String,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewClassification {
    pub message_id: String,
    pub category: Category,
    pub urgency: Urgency,
    pub safe_to_reply: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub model_used: String,
    pub tokens_used: i64,
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid enum value {0}")]
    InvalidValue(String),
    #[error("classification not found for message {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ClassificationRepository {
    db: Database,
}

impl ClassificationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create-or-fetch-existing keyed by message id. The classifier runs at
    /// most once per message; a concurrent duplicate resolves to the stored
    /// row.
    pub async fn create_or_get(
        &self,
        new_classification: NewClassification,
    ) -> Result<(Classification, bool), ClassificationError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO classifications (id, message_id, category, urgency, safe_to_reply, confidence, reasoning, model_used, tokens_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(message_id) DO NOTHING",
                params![
                    id,
                    new_classification.message_id.clone(),
                    new_classification.category.as_str(),
                    new_classification.urgency.as_str(),
                    new_classification.safe_to_reply as i64,
                    new_classification.confidence,
                    new_classification.reasoning,
                    new_classification.model_used,
                    new_classification.tokens_used,
                    now
                ],
            )
            .await?;

        let stored = self
            .get_by_message(&new_classification.message_id)
            .await?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_by_message(
        &self,
        message_id: &str,
    ) -> Result<Classification, ClassificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CLASSIFICATION_COLUMNS} FROM classifications WHERE message_id = ?1"
                ),
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_classification(row),
            None => Err(ClassificationError::NotFound(message_id.to_string())),
        }
    }

    pub async fn exists(&self, message_id: &str) -> Result<bool, ClassificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM classifications WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }
}

fn row_to_classification(row: Row) -> Result<Classification, ClassificationError> {
    let category_str: String = row.get(2)?;
    let urgency_str: String = row.get(3)?;
    let safe_to_reply: i64 = row.get(4)?;
    let created_at: String = row.get(9)?;

    let category = Category::from_str(&category_str)
        .ok_or(ClassificationError::InvalidValue(category_str))?;
    let urgency =
        Urgency::from_str(&urgency_str).ok_or(ClassificationError::InvalidValue(urgency_str))?;

    Ok(Classification {
        id: row.get(0)?,
        message_id: row.get(1)?,
        category,
        urgency,
        safe_to_reply: safe_to_reply != 0,
        confidence: row.get(5)?,
        reasoning: row.get(6)?,
        model_used: row.get(7)?,
        tokens_used: row.get(8)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
