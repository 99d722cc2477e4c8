use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::accounts::{AccountRepository, SyncStatus};
use crate::classifications::ClassificationRepository;
use crate::decisions::DecisionRepository;
use crate::messages::{MessageError, MessageRepository};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::{Job, JobError};

use super::{
    JOB_TYPE_CLASSIFY_MESSAGE, JOB_TYPE_DECIDE_MESSAGE, JOB_TYPE_INGEST_MESSAGE, JobDispatcher,
    account_lane, map_account_error, map_provider_error,
};

#[derive(Debug, Deserialize)]
struct ResyncPayload {
    account_id: String,
}

/// Full resync after the incremental cursor went stale (or never existed):
/// enumerate the mailbox, make sure every message that still lacks a decision
/// is (re-)driven through ingest/classify/decide, and reset the cursor to the
/// provider's current watermark.
pub async fn handle_resync_account(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: ResyncPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid resync.account payload: {err}")))?;

    let account_repo = AccountRepository::new(dispatcher.db.clone());
    let account = account_repo
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| map_account_error("load account", err))?;

    let mut state = account.state.clone();
    state.sync_status = SyncStatus::Resyncing;
    account_repo
        .update_state(&account.id, &state)
        .await
        .map_err(|err| map_account_error("mark resyncing", err))?;

    let snapshot = dispatcher
        .provider
        .snapshot(&account)
        .await
        .map_err(|err| map_provider_error("snapshot", err))?;

    let queue = dispatcher.queue();
    let messages = MessageRepository::new(dispatcher.db.clone());
    let classifications = ClassificationRepository::new(dispatcher.db.clone());
    let decisions = DecisionRepository::new(dispatcher.db.clone());

    let total = snapshot.provider_message_ids.len();
    let mut enqueued = 0usize;

    for provider_message_id in &snapshot.provider_message_ids {
        let stored = match messages
            .get_by_provider_id(&payload.account_id, provider_message_id)
            .await
        {
            Ok(message) => Some(message),
            Err(MessageError::NotFound(_)) => None,
            Err(err) => return Err(JobError::retryable(format!("load message: {err}"))),
        };

        match stored {
            None => {
                // Unknown message: the normal ingest chain takes it from here.
                enqueue_step(
                    &queue,
                    JOB_TYPE_INGEST_MESSAGE,
                    &payload.account_id,
                    provider_message_id,
                )
                .await?;
                enqueued += 1;
            }
            Some(message) => {
                let decided = decisions
                    .exists_for_message(&message.id)
                    .await
                    .map_err(|err| JobError::retryable(format!("check decision: {err}")))?;
                if decided {
                    continue;
                }

                // Ingested but never triaged: resume at the right stage.
                let classified = classifications
                    .exists(&message.id)
                    .await
                    .map_err(|err| JobError::retryable(format!("check classification: {err}")))?;
                let job_type = if classified {
                    JOB_TYPE_DECIDE_MESSAGE
                } else {
                    JOB_TYPE_CLASSIFY_MESSAGE
                };
                enqueue_step(&queue, job_type, &payload.account_id, provider_message_id).await?;
                enqueued += 1;
            }
        }
    }

    account_repo
        .reset_cursor(&payload.account_id, &snapshot.cursor)
        .await
        .map_err(|err| map_account_error("reset cursor", err))?;

    info!(
        account_id = %payload.account_id,
        cursor = %snapshot.cursor,
        total,
        enqueued,
        "full resync complete"
    );

    Ok(())
}

async fn enqueue_step(
    queue: &JobQueue,
    job_type: &str,
    account_id: &str,
    provider_message_id: &str,
) -> Result<(), JobError> {
    let payload = json!({
        "account_id": account_id,
        "provider_message_id": provider_message_id,
    });
    let key = format!("{job_type}:{account_id}:{provider_message_id}");

    queue
        .enqueue_idempotent(
            job_type,
            payload,
            EnqueueOptions {
                lane: Some(account_lane(account_id)),
                idempotency_key: Some(key),
                priority: 0,
                not_before: None,
            },
        )
        .await
        .map_err(|err| JobError::retryable(format!("enqueue {job_type} failed: {err}")))?;
    Ok(())
}
