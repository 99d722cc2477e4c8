use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::accounts::AccountRepository;
use crate::messages::{Direction, MessageRepository, NewMessage};
use crate::queue::EnqueueOptions;
use crate::threads::ThreadRepository;
use crate::{Job, JobError};

use super::{
    JOB_TYPE_CLASSIFY_MESSAGE, JobDispatcher, account_lane, map_account_error, map_provider_error,
};

#[derive(Debug, Deserialize)]
struct IngestPayload {
    account_id: String,
    provider_message_id: String,
}

/// Fetch one message from the provider, persist it (idempotently) with its
/// thread, refresh the thread rollups, and hand incoming mail to the
/// classifier chain.
pub async fn handle_ingest_message(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: IngestPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid ingest.message payload: {err}")))?;

    let account_repo = AccountRepository::new(dispatcher.db.clone());
    let account = account_repo
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| map_account_error("load account", err))?;

    let remote = dispatcher
        .provider
        .fetch_message(&account, &payload.provider_message_id)
        .await
        .map_err(|err| map_provider_error("fetch_message", err))?;

    let thread_repo = ThreadRepository::new(dispatcher.db.clone());
    let thread = thread_repo
        .upsert(
            &payload.account_id,
            &remote.provider_thread_id,
            remote.subject.clone(),
            remote.snippet.clone(),
        )
        .await
        .map_err(|err| JobError::retryable(format!("upsert thread failed: {err}")))?;

    let msg_repo = MessageRepository::new(dispatcher.db.clone());
    let (message, created) = msg_repo
        .create_or_get(NewMessage {
            account_id: payload.account_id.clone(),
            thread_id: thread.id.clone(),
            provider_message_id: remote.provider_message_id.clone(),
            direction: remote.direction,
            from_email: remote.from.as_ref().map(|mailbox| mailbox.email.clone()),
            from_name: remote.from.as_ref().and_then(|mailbox| mailbox.name.clone()),
            to: remote.to,
            cc: remote.cc,
            bcc: remote.bcc,
            subject: remote.subject,
            snippet: remote.snippet,
            body_plain: remote.body_plain,
            body_html: remote.body_html,
            headers: remote.headers,
            attachments: remote.attachments,
            received_at: Some(remote.received_at),
        })
        .await
        .map_err(|err| JobError::retryable(format!("store message failed: {err}")))?;

    thread_repo
        .refresh_rollups(&thread.id)
        .await
        .map_err(|err| JobError::retryable(format!("refresh thread failed: {err}")))?;

    if !created {
        debug!(
            account_id = %payload.account_id,
            provider_message_id = %payload.provider_message_id,
            "message already stored, redelivery"
        );
    }

    // Outgoing copies synced back from the provider are stored for the
    // thread record but never triaged.
    if message.direction == Direction::Incoming {
        let key = format!(
            "{JOB_TYPE_CLASSIFY_MESSAGE}:{}:{}",
            payload.account_id, payload.provider_message_id
        );
        dispatcher
            .queue()
            .enqueue_idempotent(
                JOB_TYPE_CLASSIFY_MESSAGE,
                json!({
                    "account_id": payload.account_id,
                    "provider_message_id": payload.provider_message_id,
                }),
                EnqueueOptions {
                    lane: Some(account_lane(&payload.account_id)),
                    idempotency_key: Some(key),
                    priority: 0,
                    not_before: None,
                },
            )
            .await
            .map_err(|err| JobError::retryable(format!("enqueue classify failed: {err}")))?;
    }

    info!(
        account_id = %payload.account_id,
        provider_message_id = %payload.provider_message_id,
        thread_id = %thread.id,
        created,
        "message ingested"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{run_job, setup_fixture};
    use crate::jobs::JOB_TYPE_INGEST_MESSAGE;
    use crate::messages::Mailbox;
    use crate::provider::RemoteMessage;
    use chrono::Utc;

    fn remote(provider_message_id: &str, direction: Direction) -> RemoteMessage {
        RemoteMessage {
            provider_message_id: provider_message_id.into(),
            provider_thread_id: "thr-1".into(),
            direction,
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
            subject: Some("Greetings".into()),
            snippet: Some("Hello world".into()),
            body_plain: Some("Hello world".into()),
            body_html: Some("<p>Hello world</p>".into()),
            headers: json!({"Message-Id": "<m1@example.com>"}),
            attachments: vec![],
            received_at: Utc::now(),
        }
    }

    async fn enqueue_ingest(
        fixture: &crate::jobs::testing::JobFixture,
        provider_message_id: &str,
    ) -> String {
        fixture
            .queue
            .enqueue(
                JOB_TYPE_INGEST_MESSAGE,
                json!({
                    "account_id": fixture.account.id,
                    "provider_message_id": provider_message_id,
                }),
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue ingest")
    }

    async fn count_jobs(fixture: &crate::jobs::testing::JobFixture, job_type: &str) -> i64 {
        let conn = fixture.dispatcher.db.connection().await.expect("conn");
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE type = ?1",
                libsql::params![job_type],
            )
            .await
            .expect("query");
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    #[tokio::test]
    async fn ingest_persists_message_thread_and_enqueues_classify() {
        let fixture = setup_fixture().await;
        fixture.provider.put_message(remote("m1", Direction::Incoming));

        let job_id = enqueue_ingest(&fixture, "m1").await;
        run_job(&fixture, &job_id).await.expect("ingest succeeds");

        let thread = ThreadRepository::new(fixture.dispatcher.db.clone())
            .get_by_provider_id(&fixture.account.id, "thr-1")
            .await
            .expect("thread");
        assert_eq!(thread.subject.as_deref(), Some("Greetings"));
        assert_eq!(thread.message_count, 1);
        assert!(thread.is_unread);
        assert!(!thread.participants.is_empty());

        let stored = MessageRepository::new(fixture.dispatcher.db.clone())
            .get_by_provider_id(&fixture.account.id, "m1")
            .await
            .expect("message");
        assert_eq!(stored.body_plain.as_deref(), Some("Hello world"));
        assert_eq!(stored.from_email.as_deref(), Some("alice@example.com"));

        assert_eq!(count_jobs(&fixture, JOB_TYPE_CLASSIFY_MESSAGE).await, 1);
    }

    #[tokio::test]
    async fn redelivered_ingest_is_a_no_op() {
        let fixture = setup_fixture().await;
        fixture.provider.put_message(remote("m1", Direction::Incoming));

        let first = enqueue_ingest(&fixture, "m1").await;
        run_job(&fixture, &first).await.expect("first ingest");

        let second = enqueue_ingest(&fixture, "m1").await;
        run_job(&fixture, &second).await.expect("second ingest");

        let thread = ThreadRepository::new(fixture.dispatcher.db.clone())
            .get_by_provider_id(&fixture.account.id, "thr-1")
            .await
            .expect("thread");
        assert_eq!(thread.message_count, 1, "rollups unchanged by redelivery");
        assert_eq!(count_jobs(&fixture, JOB_TYPE_CLASSIFY_MESSAGE).await, 1);
    }

    #[tokio::test]
    async fn outgoing_messages_are_stored_but_not_classified() {
        let fixture = setup_fixture().await;
        fixture
            .provider
            .put_message(remote("m-out", Direction::Outgoing));

        let job_id = enqueue_ingest(&fixture, "m-out").await;
        run_job(&fixture, &job_id).await.expect("ingest succeeds");

        assert!(
            MessageRepository::new(fixture.dispatcher.db.clone())
                .exists(&fixture.account.id, "m-out")
                .await
                .expect("exists")
        );
        assert_eq!(count_jobs(&fixture, JOB_TYPE_CLASSIFY_MESSAGE).await, 0);
    }

    #[tokio::test]
    async fn missing_remote_message_is_fatal() {
        let fixture = setup_fixture().await;

        let job_id = enqueue_ingest(&fixture, "absent").await;
        let err = run_job(&fixture, &job_id).await.expect_err("fatal");
        assert!(matches!(err, JobError::Fatal(_)));
    }
}
