use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use pembroke_core::accounts::{Account, AccountRepository};
use pembroke_core::ai::{ClassificationOutcome, MockClassifier, MockDrafter};
use pembroke_core::audit::AuditLog;
use pembroke_core::classifications::{Category, Urgency};
use pembroke_core::jobs::JobDispatcher;
use pembroke_core::messages::{Direction, Mailbox};
use pembroke_core::migrations::run_migrations;
use pembroke_core::provider::{MockMailProvider, RemoteMessage};
use pembroke_core::queue::JobQueue;
use pembroke_core::worker::JobExecutor;
use pembroke_core::Database;

pub struct Harness {
    pub db: Database,
    pub queue: JobQueue,
    pub dispatcher: JobDispatcher,
    pub provider: MockMailProvider,
    pub classifier: MockClassifier,
    pub drafter: MockDrafter,
    pub audit: AuditLog,
    pub account: Account,
    pub _dir: TempDir,
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
    let db_path = dir.path().join(db_name);
    let db = Database::new(&db_path).await.expect("create db");
    run_migrations(&db).await.expect("migrations");

    let account = AccountRepository::new(db.clone())
        .create("user@example.com", Some("User".into()))
        .await
        .expect("account");

    let provider = MockMailProvider::new();
    let classifier = MockClassifier::new();
    let drafter = MockDrafter::new();
    let dispatcher = JobDispatcher::new(
        db.clone(),
        Arc::new(provider.clone()),
        Arc::new(classifier.clone()),
        Arc::new(drafter.clone()),
    );

    Harness {
        queue: JobQueue::new(db.clone()),
        audit: AuditLog::new(db.clone()),
        db,
        dispatcher,
        provider,
        classifier,
        drafter,
        account,
        _dir: dir,
    }
}

/// Run queued jobs to quiescence, the way the worker pool would. Retryable
/// failures are requeued with a future `not_before`, so they do not spin the
/// drain loop.
pub async fn drain_queue(harness: &Harness) {
    loop {
        let Some(job) = harness.queue.claim_next().await.expect("claim") else {
            break;
        };
        match harness.dispatcher.execute(job.clone()).await {
            Ok(()) => harness
                .queue
                .complete(&job.id, None)
                .await
                .expect("complete job"),
            Err(err) => harness
                .queue
                .fail(&job.id, err.to_string(), err.is_retryable(), None)
                .await
                .expect("fail job"),
        }
    }
}

pub fn remote_message(provider_message_id: &str, provider_thread_id: &str) -> RemoteMessage {
    RemoteMessage {
        provider_message_id: provider_message_id.into(),
        provider_thread_id: provider_thread_id.into(),
        direction: Direction::Incoming,
        from: Some(Mailbox {
            email: "alice@example.com".into(),
            name: Some("Alice".into()),
        }),
        to: vec![Mailbox {
            email: "user@example.com".into(),
            name: None,
        }],
        cc: vec![],
        bcc: vec![],
        subject: Some("Order question".into()),
        snippet: Some("Where is my order?".into()),
        body_plain: Some("Where is my order?".into()),
        body_html: None,
        headers: serde_json::json!({"Message-Id": format!("<{provider_message_id}@example.com>")}),
        attachments: vec![],
        received_at: Utc::now(),
    }
}

pub fn outcome(
    category: Category,
    urgency: Urgency,
    safe_to_reply: bool,
    confidence: f64,
) -> ClassificationOutcome {
    ClassificationOutcome {
        category,
        urgency,
        safe_to_reply,
        confidence,
        reasoning: "scripted classification".into(),
        model_used: "classifier-v2".into(),
        tokens_used: 120,
    }
}

pub async fn count_rows(db: &Database, table: &str) -> i64 {
    let conn = db.connection().await.expect("conn");
    let mut rows = conn
        .query(&format!("SELECT COUNT(*) FROM {table}"), ())
        .await
        .expect("query");
    rows.next().await.unwrap().unwrap().get(0).unwrap()
}
