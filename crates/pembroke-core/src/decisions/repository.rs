use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::types::{Decision, DecisionType, NewDecision};

const DECISION_COLUMNS: &str = "id, account_id, thread_id, message_id, decision_type, reasoning, confidence, matched_rule_id, created_at";

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid decision type {0}")]
    InvalidType(String),
    #[error("decision not found for message {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct DecisionRepository {
    db: Database,
}

impl DecisionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Decision creation is the sync boundary between "ingested" and
    /// "triaged": create-or-fetch-existing keyed by message id, so a
    /// double-insert from a retried pipeline run is a benign idempotent hit.
    /// Returns the stored decision and whether this call created it.
    pub async fn create_or_get(
        &self,
        new_decision: NewDecision,
    ) -> Result<(Decision, bool), DecisionError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO decisions (id, account_id, thread_id, message_id, decision_type, reasoning, confidence, matched_rule_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id) DO NOTHING",
                params![
                    id,
                    new_decision.account_id,
                    new_decision.thread_id,
                    new_decision.message_id.clone(),
                    new_decision.decision_type.as_str(),
                    new_decision.reasoning,
                    new_decision.confidence,
                    new_decision.matched_rule_id,
                    now
                ],
            )
            .await?;

        let stored = self.get_by_message(&new_decision.message_id).await?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Decision, DecisionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_decision(row),
            None => Err(DecisionError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_message(&self, message_id: &str) -> Result<Decision, DecisionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE message_id = ?1"),
                params![message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_decision(row),
            None => Err(DecisionError::NotFound(message_id.to_string())),
        }
    }

    pub async fn exists_for_message(&self, message_id: &str) -> Result<bool, DecisionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM decisions WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }
}

fn row_to_decision(row: Row) -> Result<Decision, DecisionError> {
    let decision_type_str: String = row.get(4)?;
    let created_at: String = row.get(8)?;

    let decision_type = DecisionType::from_str(&decision_type_str)
        .ok_or(DecisionError::InvalidType(decision_type_str))?;

    Ok(Decision {
        id: row.get(0)?,
        account_id: row.get(1)?,
        thread_id: row.get(2)?,
        message_id: row.get(3)?,
        decision_type,
        reasoning: row.get(5)?,
        confidence: row.get(6)?,
        matched_rule_id: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::messages::{Direction, MessageRepository, NewMessage};
    use crate::migrations::run_migrations;
    use crate::threads::ThreadRepository;
    use tempfile::TempDir;

    struct Fixture {
        repo: DecisionRepository,
        account_id: String,
        thread_id: String,
        message_id: String,
        _dir: TempDir,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");

        let account_id = AccountRepository::new(db.clone())
            .create("user@example.com", None)
            .await
            .expect("account")
            .id;
        let thread_id = ThreadRepository::new(db.clone())
            .upsert(&account_id, "thread1", None, None)
            .await
            .expect("thread")
            .id;
        let (message, _) = MessageRepository::new(db.clone())
            .create_or_get(NewMessage {
                account_id: account_id.clone(),
                thread_id: thread_id.clone(),
                provider_message_id: "msg1".into(),
                direction: Direction::Incoming,
                from_email: Some("alice@example.com".into()),
                from_name: None,
                to: vec![],
                cc: vec![],
                bcc: vec![],
                subject: Some("Hello".into()),
                snippet: None,
                body_plain: None,
                body_html: None,
                headers: serde_json::json!({}),
                attachments: vec![],
                received_at: Some(Utc::now()),
            })
            .await
            .expect("message");

        Fixture {
            repo: DecisionRepository::new(db),
            account_id,
            thread_id,
            message_id: message.id,
            _dir: dir,
        }
    }

    fn sample(fixture: &Fixture, decision_type: DecisionType) -> NewDecision {
        NewDecision {
            account_id: fixture.account_id.clone(),
            thread_id: fixture.thread_id.clone(),
            message_id: fixture.message_id.clone(),
            decision_type,
            reasoning: "default policy".into(),
            confidence: 0.9,
            matched_rule_id: None,
        }
    }

    #[tokio::test]
    async fn create_or_get_creates_exactly_once() {
        let fixture = setup().await;
        let (first, created) = fixture
            .repo
            .create_or_get(sample(&fixture, DecisionType::AutoSend))
            .await
            .expect("first");
        assert!(created);
        assert_eq!(first.decision_type, DecisionType::AutoSend);

        // A re-run with a different outcome must not overwrite the stored
        // decision.
        let (second, created) = fixture
            .repo
            .create_or_get(sample(&fixture, DecisionType::Escalate))
            .await
            .expect("second");
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.decision_type, DecisionType::AutoSend);
        assert_eq!(second, first, "idempotent hit returns identical decision");
    }

    #[tokio::test]
    async fn lookup_by_message_and_id() {
        let fixture = setup().await;
        let (decision, _) = fixture
            .repo
            .create_or_get(sample(&fixture, DecisionType::DraftOnly))
            .await
            .expect("create");

        let by_message = fixture
            .repo
            .get_by_message(&fixture.message_id)
            .await
            .expect("by message");
        assert_eq!(by_message, decision);

        let by_id = fixture.repo.get_by_id(&decision.id).await.expect("by id");
        assert_eq!(by_id, decision);

        assert!(
            fixture
                .repo
                .exists_for_message(&fixture.message_id)
                .await
                .expect("exists")
        );
        assert!(
            !fixture
                .repo
                .exists_for_message("absent")
                .await
                .expect("exists")
        );
    }
}
