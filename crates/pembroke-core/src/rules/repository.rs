use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::decisions::DecisionType;

use super::types::{Condition, NewRule, Rule};

const RULE_COLUMNS: &str =
    "id, name, description, is_active, priority, conditions_json, action, auto_approve, created_at, updated_at";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid action value {0}")]
    InvalidAction(String),
    #[error("rule not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_rule: NewRule) -> Result<Rule, RuleError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conditions_json = serde_json::to_string(&new_rule.conditions)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rules (id, name, description, is_active, priority, conditions_json, action, auto_approve, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    new_rule.name,
                    new_rule.description,
                    new_rule.is_active as i64,
                    new_rule.priority,
                    conditions_json,
                    new_rule.action.as_str(),
                    new_rule.auto_approve as i64,
                    now
                ],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| RuleError::NotFound("insert failed".into()))?;
        row_to_rule(row)?.ok_or_else(|| RuleError::NotFound("insert produced bad row".into()))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row)?.ok_or_else(|| RuleError::NotFound(id.to_string())),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    /// Active rules for the engine. A rule whose stored conditions no longer
    /// parse is skipped (it can never match) rather than failing the whole
    /// pipeline.
    pub async fn list_active(&self) -> Result<Vec<Rule>, RuleError> {
        self.list_where("WHERE is_active = 1").await
    }

    pub async fn list_all(&self) -> Result<Vec<Rule>, RuleError> {
        self.list_where("").await
    }

    async fn list_where(&self, filter: &str) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules {filter} ORDER BY priority, id"),
                (),
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            if let Some(rule) = row_to_rule(row)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    pub async fn set_active(&self, id: &str, is_active: bool) -> Result<Rule, RuleError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE rules SET is_active = ?1, updated_at = ?2 WHERE id = ?3
                     RETURNING {RULE_COLUMNS}"
                ),
                params![is_active as i64, now, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row)?.ok_or_else(|| RuleError::NotFound(id.to_string())),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("DELETE FROM rules WHERE id = ?1 RETURNING id", params![id])
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }
}

/// `None` means the stored row is unusable (malformed conditions or action)
/// and should be treated as if the rule did not exist.
fn row_to_rule(row: Row) -> Result<Option<Rule>, RuleError> {
    let id: String = row.get(0)?;
    let is_active: i64 = row.get(3)?;
    let conditions_json: String = row.get(5)?;
    let action_str: String = row.get(6)?;
    let auto_approve: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    let conditions: Vec<Condition> = match serde_json::from_str(&conditions_json) {
        Ok(conditions) => conditions,
        Err(err) => {
            warn!(rule_id = %id, error = %err, "skipping rule with malformed conditions");
            return Ok(None);
        }
    };

    let Some(action) = DecisionType::from_str(&action_str) else {
        warn!(rule_id = %id, action = %action_str, "skipping rule with unknown action");
        return Ok(None);
    };

    Ok(Some(Rule {
        id,
        name: row.get(1)?,
        description: row.get(2)?,
        is_active: is_active != 0,
        priority: row.get(4)?,
        conditions,
        action,
        auto_approve: auto_approve != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    }))
}
