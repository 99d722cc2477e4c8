use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::accounts::{AccountError, AccountRepository};
use crate::audit::AuditLog;
use crate::db::{Database, DbError};
use crate::decisions::Decision;
use crate::drafts::{Draft, DraftError, DraftStore};
use crate::provider::MailProvider;
use crate::sending::{SendError, deliver_draft};

const APPROVAL_COLUMNS: &str =
    "id, decision_id, draft_id, message_id, status, reviewed_at, reviewer_notes, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Modified => "modified",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "modified" => Some(Self::Modified),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// One queued human-review unit for a NEEDS_APPROVAL decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalItem {
    pub id: String,
    pub decision_id: String,
    pub draft_id: String,
    pub message_id: String,
    pub status: ApprovalStatus,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid status value {0}")]
    InvalidStatus(String),
    #[error("approval item not found: {0}")]
    NotFound(String),
    #[error("approval item {item_id} is {status:?}; only pending items can transition")]
    InvalidTransition {
        item_id: String,
        status: ApprovalStatus,
    },
    #[error("draft error: {0}")]
    Draft(#[from] DraftError),
    #[error("decision error: {0}")]
    Decision(#[from] crate::decisions::DecisionError),
    #[error("account error: {0}")]
    Account(#[from] AccountError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Clone)]
pub struct ApprovalRepository {
    db: Database,
}

impl ApprovalRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One item per decision, create-or-fetch-existing.
    pub async fn create_or_get(
        &self,
        decision: &Decision,
        draft: &Draft,
    ) -> Result<(ApprovalItem, bool), ApprovalError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO approval_items (id, decision_id, draft_id, message_id, status, reviewed_at, reviewer_notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', NULL, NULL, ?5)
                 ON CONFLICT(decision_id) DO NOTHING",
                params![
                    id,
                    decision.id.clone(),
                    draft.id.clone(),
                    decision.message_id.clone(),
                    now
                ],
            )
            .await?;

        let stored = self.get_by_decision(&decision.id).await?;
        Ok((stored, inserted > 0))
    }

    pub async fn get_by_id(&self, item_id: &str) -> Result<ApprovalItem, ApprovalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {APPROVAL_COLUMNS} FROM approval_items WHERE id = ?1"),
                params![item_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_item(row),
            None => Err(ApprovalError::NotFound(item_id.to_string())),
        }
    }

    pub async fn get_by_decision(&self, decision_id: &str) -> Result<ApprovalItem, ApprovalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {APPROVAL_COLUMNS} FROM approval_items WHERE decision_id = ?1"),
                params![decision_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_item(row),
            None => Err(ApprovalError::NotFound(decision_id.to_string())),
        }
    }

    pub async fn exists_for_decision(&self, decision_id: &str) -> Result<bool, ApprovalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM approval_items WHERE decision_id = ?1 LIMIT 1",
                params![decision_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Pending items, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalItem>, ApprovalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approval_items
                     WHERE status = 'pending' ORDER BY created_at"
                ),
                (),
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }

    /// Atomic conditional transition out of `pending`. The status check and
    /// the write are one UPDATE, so concurrent reviewers cannot both claim
    /// an item.
    async fn claim(
        &self,
        item_id: &str,
        target: ApprovalStatus,
        notes: Option<&str>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let now = now_rfc3339();
        let notes = notes.map(str::to_string);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE approval_items
                     SET status = ?2, reviewed_at = ?3, reviewer_notes = ?4
                     WHERE id = ?1 AND status = 'pending'
                     RETURNING {APPROVAL_COLUMNS}"
                ),
                params![item_id, target.as_str(), now, notes],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_item(row),
            None => {
                let existing = self.get_by_id(item_id).await?;
                Err(ApprovalError::InvalidTransition {
                    item_id: item_id.to_string(),
                    status: existing.status,
                })
            }
        }
    }

    /// Compensating action when a send fails after a claim: the item
    /// observably stays pending.
    async fn release(
        &self,
        item_id: &str,
        claimed_as: ApprovalStatus,
    ) -> Result<(), ApprovalError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE approval_items
             SET status = 'pending', reviewed_at = NULL
             WHERE id = ?1 AND status = ?2",
            params![item_id, claimed_as.as_str()],
        )
        .await?;
        Ok(())
    }
}

/// Human-review state machine over pending approval items. `approve` and
/// `modify` send synchronously through the provider; a failed send releases
/// the claim and surfaces the error rather than silently changing state.
#[derive(Clone)]
pub struct ApprovalQueue {
    db: Database,
    repo: ApprovalRepository,
    drafts: DraftStore,
    accounts: AccountRepository,
    provider: Arc<dyn MailProvider>,
    audit: AuditLog,
}

impl ApprovalQueue {
    pub fn new(db: Database, provider: Arc<dyn MailProvider>, audit: AuditLog) -> Self {
        Self {
            repo: ApprovalRepository::new(db.clone()),
            drafts: DraftStore::new(db.clone()),
            accounts: AccountRepository::new(db.clone()),
            db,
            provider,
            audit,
        }
    }

    pub fn repository(&self) -> &ApprovalRepository {
        &self.repo
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalItem>, ApprovalError> {
        self.repo.list_pending().await
    }

    /// Approve and send the associated draft. On send failure the item stays
    /// pending and the failure surfaces to the caller.
    pub async fn approve(&self, item_id: &str) -> Result<ApprovalItem, ApprovalError> {
        let claimed = self.repo.claim(item_id, ApprovalStatus::Approved, None).await?;

        let draft = self.drafts.get_by_id(&claimed.draft_id).await?;
        match self.send_for_item(&claimed, &draft).await {
            Ok(()) => {
                self.audit.record(
                    "approval.approved",
                    "approval_item",
                    claimed.id.clone(),
                    json!({"decision_id": claimed.decision_id, "draft_id": claimed.draft_id}),
                );
                Ok(claimed)
            }
            Err(err) => {
                self.repo.release(item_id, ApprovalStatus::Approved).await?;
                Err(err)
            }
        }
    }

    /// Reject without sending; stores the reviewer's notes.
    pub async fn reject(
        &self,
        item_id: &str,
        notes: Option<&str>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let rejected = self
            .repo
            .claim(item_id, ApprovalStatus::Rejected, notes)
            .await?;
        self.audit.record(
            "approval.rejected",
            "approval_item",
            rejected.id.clone(),
            json!({"decision_id": rejected.decision_id, "notes": notes}),
        );
        Ok(rejected)
    }

    /// Revise the draft to the reviewer's content and send the revised
    /// version. Modify implies intent to send.
    pub async fn modify(
        &self,
        item_id: &str,
        subject: Option<&str>,
        body_text: &str,
    ) -> Result<ApprovalItem, ApprovalError> {
        let claimed = self.repo.claim(item_id, ApprovalStatus::Modified, None).await?;

        let revised = match self
            .drafts
            .revise(&claimed.draft_id, subject, body_text, None)
            .await
        {
            Ok(draft) => draft,
            Err(err) => {
                self.repo.release(item_id, ApprovalStatus::Modified).await?;
                return Err(err.into());
            }
        };

        match self.send_for_item(&claimed, &revised).await {
            Ok(()) => {
                self.audit.record(
                    "approval.modified",
                    "approval_item",
                    claimed.id.clone(),
                    json!({
                        "decision_id": claimed.decision_id,
                        "draft_id": claimed.draft_id,
                        "version": revised.version,
                    }),
                );
                Ok(claimed)
            }
            Err(err) => {
                self.repo.release(item_id, ApprovalStatus::Modified).await?;
                Err(err)
            }
        }
    }

    async fn send_for_item(
        &self,
        item: &ApprovalItem,
        draft: &Draft,
    ) -> Result<(), ApprovalError> {
        let decision_repo = crate::decisions::DecisionRepository::new(self.db.clone());
        let decision = decision_repo.get_by_id(&item.decision_id).await?;
        let account = self.accounts.get_by_id(&decision.account_id).await?;
        deliver_draft(&self.db, self.provider.as_ref(), &account, draft, &self.audit).await?;
        Ok(())
    }
}

fn row_to_item(row: Row) -> Result<ApprovalItem, ApprovalError> {
    let status_str: String = row.get(4)?;
    let reviewed_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;

    let status =
        ApprovalStatus::from_str(&status_str).ok_or(ApprovalError::InvalidStatus(status_str))?;

    Ok(ApprovalItem {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        draft_id: row.get(2)?,
        message_id: row.get(3)?,
        status,
        reviewed_at: match reviewed_at {
            Some(value) => Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc)),
            None => None,
        },
        reviewer_notes: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::ai::DraftContent;
    use crate::decisions::{DecisionRepository, DecisionType, NewDecision};
    use crate::messages::{Direction, MessageRepository, NewMessage};
    use crate::migrations::run_migrations;
    use crate::provider::{MockMailProvider, ProviderError};
    use crate::threads::ThreadRepository;
    use tempfile::TempDir;

    struct Fixture {
        queue: ApprovalQueue,
        provider: MockMailProvider,
        drafts: DraftStore,
        item: ApprovalItem,
        _account: Account,
        _dir: TempDir,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");

        let account = AccountRepository::new(db.clone())
            .create("user@example.com", None)
            .await
            .expect("account");
        let thread = ThreadRepository::new(db.clone())
            .upsert(&account.id, "thr-1", Some("Hello".into()), None)
            .await
            .expect("thread");
        let (message, _) = MessageRepository::new(db.clone())
            .create_or_get(NewMessage {
                account_id: account.id.clone(),
                thread_id: thread.id.clone(),
                provider_message_id: "m1".into(),
                direction: Direction::Incoming,
                from_email: Some("alice@example.com".into()),
                from_name: None,
                to: vec![],
                cc: vec![],
                bcc: vec![],
                subject: Some("Hello".into()),
                snippet: None,
                body_plain: Some("Hi".into()),
                body_html: None,
                headers: serde_json::json!({}),
                attachments: vec![],
                received_at: Some(chrono::Utc::now()),
            })
            .await
            .expect("message");
        let (decision, _) = DecisionRepository::new(db.clone())
            .create_or_get(NewDecision {
                account_id: account.id.clone(),
                thread_id: thread.id.clone(),
                message_id: message.id.clone(),
                decision_type: DecisionType::NeedsApproval,
                reasoning: "unsafe to reply automatically".into(),
                confidence: 0.7,
                matched_rule_id: None,
            })
            .await
            .expect("decision");
        let drafts = DraftStore::new(db.clone());
        let (draft, _) = drafts
            .create_or_get(
                &decision,
                DraftContent {
                    subject: "Re: Hello".into(),
                    body_text: "Original draft".into(),
                    body_html: None,
                    tone: "professional".into(),
                },
            )
            .await
            .expect("draft");

        let repo = ApprovalRepository::new(db.clone());
        let (item, created) = repo.create_or_get(&decision, &draft).await.expect("item");
        assert!(created);

        let provider = MockMailProvider::new();
        let audit = AuditLog::new(db.clone());
        let queue = ApprovalQueue::new(db, Arc::new(provider.clone()), audit);

        Fixture {
            queue,
            provider,
            drafts,
            item,
            _account: account,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn create_or_get_is_idempotent_per_decision() {
        let fixture = setup().await;
        let repo = fixture.queue.repository();
        let item = repo.get_by_id(&fixture.item.id).await.expect("fetch");
        assert_eq!(item.status, ApprovalStatus::Pending);
        assert!(
            repo.exists_for_decision(&item.decision_id)
                .await
                .expect("exists")
        );
    }

    #[tokio::test]
    async fn approve_sends_draft_and_stamps_review() {
        let fixture = setup().await;

        let approved = fixture
            .queue
            .approve(&fixture.item.id)
            .await
            .expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(approved.reviewed_at.is_some());

        assert_eq!(fixture.provider.send_count(), 1);
        let draft = fixture
            .drafts
            .get_by_id(&fixture.item.draft_id)
            .await
            .expect("draft");
        assert!(draft.is_sent);
    }

    #[tokio::test]
    async fn approve_send_failure_keeps_item_pending() {
        let fixture = setup().await;
        fixture
            .provider
            .enqueue_send_result(Err(ProviderError::Timeout));

        let err = fixture
            .queue
            .approve(&fixture.item.id)
            .await
            .expect_err("send fails");
        assert!(matches!(err, ApprovalError::Send(_)));

        let item = fixture
            .queue
            .repository()
            .get_by_id(&fixture.item.id)
            .await
            .expect("fetch");
        assert_eq!(item.status, ApprovalStatus::Pending, "no silent transition");
        assert!(item.reviewed_at.is_none());

        // A later approve succeeds once the provider recovers.
        let approved = fixture
            .queue
            .approve(&fixture.item.id)
            .await
            .expect("retry approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn reject_stores_notes_and_never_sends() {
        let fixture = setup().await;

        let rejected = fixture
            .queue
            .reject(&fixture.item.id, Some("tone is off"))
            .await
            .expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.reviewer_notes.as_deref(), Some("tone is off"));
        assert!(rejected.reviewed_at.is_some());
        assert_eq!(fixture.provider.send_count(), 0);
    }

    #[tokio::test]
    async fn modify_revises_then_sends_new_version() {
        let fixture = setup().await;

        let modified = fixture
            .queue
            .modify(&fixture.item.id, None, "Reviewer-edited body")
            .await
            .expect("modify");
        assert_eq!(modified.status, ApprovalStatus::Modified);

        let draft = fixture
            .drafts
            .get_by_id(&fixture.item.draft_id)
            .await
            .expect("draft");
        assert_eq!(draft.version, 2);
        assert!(draft.is_sent);
        assert_eq!(draft.body_text, "Reviewer-edited body");

        let replies = fixture.provider.sent_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body_text, "Reviewer-edited body");

        let history = fixture.drafts.history(&draft.id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body_text, "Original draft");
    }

    #[tokio::test]
    async fn transitions_from_terminal_states_fail() {
        let fixture = setup().await;
        fixture
            .queue
            .reject(&fixture.item.id, None)
            .await
            .expect("reject");

        let err = fixture
            .queue
            .approve(&fixture.item.id)
            .await
            .expect_err("approve after reject");
        assert!(matches!(
            err,
            ApprovalError::InvalidTransition {
                status: ApprovalStatus::Rejected,
                ..
            }
        ));

        let err = fixture
            .queue
            .modify(&fixture.item.id, None, "late edit")
            .await
            .expect_err("modify after reject");
        assert!(matches!(err, ApprovalError::InvalidTransition { .. }));

        let err = fixture
            .queue
            .reject(&fixture.item.id, None)
            .await
            .expect_err("double reject");
        assert!(matches!(err, ApprovalError::InvalidTransition { .. }));

        // The item is unchanged by the failed attempts.
        let item = fixture
            .queue
            .repository()
            .get_by_id(&fixture.item.id)
            .await
            .expect("fetch");
        assert_eq!(item.status, ApprovalStatus::Rejected);
        assert_eq!(fixture.provider.send_count(), 0);
    }

    #[tokio::test]
    async fn list_pending_returns_oldest_first() {
        let fixture = setup().await;
        let pending = fixture.queue.list_pending().await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fixture.item.id);

        fixture
            .queue
            .reject(&fixture.item.id, None)
            .await
            .expect("reject");
        let pending = fixture.queue.list_pending().await.expect("list again");
        assert!(pending.is_empty());
    }
}
