mod common;

use common::{count_rows, drain_queue, harness, outcome, remote_message};

use pembroke_core::accounts::{AccountRepository, SyncStatus};
use pembroke_core::classifications::{Category, Urgency};
use pembroke_core::decisions::DecisionRepository;
use pembroke_core::messages::MessageRepository;
use pembroke_core::provider::{ChangeBatch, ChangeRecord, MailboxSnapshot, ProviderError};
use pembroke_core::scheduler::notify_change;
use pembroke_core::threads::ThreadRepository;

fn added(provider_message_id: &str, provider_thread_id: &str) -> ChangeRecord {
    ChangeRecord::MessageAdded {
        provider_message_id: provider_message_id.into(),
        provider_thread_id: provider_thread_id.into(),
    }
}

#[tokio::test]
async fn push_notification_drives_message_to_decision() {
    let h = harness().await;
    let accounts = AccountRepository::new(h.db.clone());
    accounts
        .advance_cursor(&h.account.id, "10")
        .await
        .expect("seed cursor");

    h.provider.put_message(remote_message("m1", "t1"));
    h.provider.enqueue_changes(Ok(ChangeBatch {
        changes: vec![added("m1", "t1")],
        new_cursor: "20".into(),
    }));
    h.classifier
        .enqueue_response(Ok(outcome(Category::Support, Urgency::Medium, true, 0.6)));

    notify_change(&h.queue, &h.account.id, "20")
        .await
        .expect("push");
    drain_queue(&h).await;

    let message = MessageRepository::new(h.db.clone())
        .get_by_provider_id(&h.account.id, "m1")
        .await
        .expect("message stored");

    let thread = ThreadRepository::new(h.db.clone())
        .get_by_id(&message.thread_id)
        .await
        .expect("thread");
    assert_eq!(thread.message_count, 1);
    assert!(thread.is_unread);

    let decision = DecisionRepository::new(h.db.clone())
        .get_by_message(&message.id)
        .await
        .expect("decision created exactly once per message");
    assert_eq!(decision.message_id, message.id);

    let account = accounts.get_by_id(&h.account.id).await.expect("account");
    assert_eq!(account.state.history_cursor.as_deref(), Some("20"));
}

#[tokio::test]
async fn reapplying_the_same_change_set_is_a_no_op() {
    let h = harness().await;
    let accounts = AccountRepository::new(h.db.clone());
    accounts
        .advance_cursor(&h.account.id, "10")
        .await
        .expect("seed cursor");

    h.provider.put_message(remote_message("m1", "t1"));
    h.provider.put_message(remote_message("m2", "t1"));
    let batch = ChangeBatch {
        changes: vec![added("m1", "t1"), added("m2", "t1")],
        new_cursor: "20".into(),
    };
    h.provider.enqueue_changes(Ok(batch.clone()));
    h.classifier
        .enqueue_response(Ok(outcome(Category::Support, Urgency::Medium, true, 0.6)));
    h.classifier
        .enqueue_response(Ok(outcome(Category::Personal, Urgency::Low, true, 0.5)));

    notify_change(&h.queue, &h.account.id, "20")
        .await
        .expect("first push");
    drain_queue(&h).await;

    let messages_before = count_rows(&h.db, "messages").await;
    let decisions_before = count_rows(&h.db, "decisions").await;
    let drafts_before = count_rows(&h.db, "drafts").await;
    let thread_before = ThreadRepository::new(h.db.clone())
        .get_by_provider_id(&h.account.id, "t1")
        .await
        .expect("thread");

    // The provider redelivers the identical change set under a new push.
    h.provider.enqueue_changes(Ok(batch));
    notify_change(&h.queue, &h.account.id, "20-redelivery")
        .await
        .expect("second push");
    drain_queue(&h).await;

    assert_eq!(count_rows(&h.db, "messages").await, messages_before);
    assert_eq!(count_rows(&h.db, "decisions").await, decisions_before);
    assert_eq!(count_rows(&h.db, "drafts").await, drafts_before);
    assert_eq!(h.classifier.call_count(), 2, "classifier not re-invoked");

    let thread_after = ThreadRepository::new(h.db.clone())
        .get_by_provider_id(&h.account.id, "t1")
        .await
        .expect("thread");
    assert_eq!(thread_after.message_count, thread_before.message_count);
    assert_eq!(thread_after.last_message_at, thread_before.last_message_at);
    assert_eq!(thread_after.participants, thread_before.participants);
}

#[tokio::test]
async fn stale_cursor_triggers_full_resync_with_one_decision_each() {
    let h = harness().await;
    let accounts = AccountRepository::new(h.db.clone());
    accounts
        .advance_cursor(&h.account.id, "10")
        .await
        .expect("seed cursor");

    // The incremental fetch reports the watermark expired; the snapshot then
    // enumerates two undecided messages.
    h.provider.enqueue_changes(Err(ProviderError::StaleCursor));
    h.provider.put_message(remote_message("m1", "t1"));
    h.provider.put_message(remote_message("m2", "t2"));
    h.provider.enqueue_snapshot(Ok(MailboxSnapshot {
        provider_message_ids: vec!["m1".into(), "m2".into()],
        cursor: "500".into(),
    }));
    h.classifier
        .enqueue_response(Ok(outcome(Category::Support, Urgency::Medium, true, 0.6)));
    h.classifier
        .enqueue_response(Ok(outcome(Category::Personal, Urgency::Low, true, 0.5)));

    notify_change(&h.queue, &h.account.id, "11")
        .await
        .expect("push");
    drain_queue(&h).await;

    let account = accounts.get_by_id(&h.account.id).await.expect("account");
    assert_eq!(
        account.state.history_cursor.as_deref(),
        Some("500"),
        "cursor reset to the provider's watermark"
    );
    assert_eq!(account.state.sync_status, SyncStatus::Normal);

    let decisions = DecisionRepository::new(h.db.clone());
    let messages = MessageRepository::new(h.db.clone());
    for provider_id in ["m1", "m2"] {
        let message = messages
            .get_by_provider_id(&h.account.id, provider_id)
            .await
            .expect("message");
        assert!(
            decisions
                .exists_for_message(&message.id)
                .await
                .expect("decision check"),
            "{provider_id} should be decided after resync"
        );
    }
    assert_eq!(count_rows(&h.db, "decisions").await, 2);
}

#[tokio::test]
async fn transient_sync_failure_parks_after_bounded_retries() {
    let h = harness().await;
    AccountRepository::new(h.db.clone())
        .advance_cursor(&h.account.id, "10")
        .await
        .expect("seed cursor");

    // Every fetch fails; the job must retry with backoff and eventually park
    // rather than loop forever. Force a single attempt to observe the park.
    h.provider
        .enqueue_changes(Err(ProviderError::Transport("connection reset".into())));
    notify_change(&h.queue, &h.account.id, "11")
        .await
        .expect("push");

    let conn = h.db.connection().await.expect("conn");
    conn.execute("UPDATE jobs SET max_attempts = 1", ())
        .await
        .expect("limit attempts");

    drain_queue(&h).await;

    let parked = h.queue.list_failed().await.expect("failed jobs");
    assert_eq!(parked.len(), 1, "exhausted job is surfaced, not dropped");
    assert!(parked[0].last_error.as_deref().unwrap().contains("transport"));
}
