use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::accounts::{AccountError, AccountRepository, SyncStatus};
use crate::provider::{ChangeRecord, ProviderError};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::{Job, JobError};

use super::{
    JOB_TYPE_INGEST_MESSAGE, JOB_TYPE_RESYNC_ACCOUNT, JobDispatcher, account_lane,
    map_account_error, map_provider_error,
};

#[derive(Debug, Deserialize)]
struct SyncPayload {
    account_id: String,
}

/// Incremental sync for one account: fetch the change set at the stored
/// cursor, fan out idempotent ingest jobs in delivered order, and advance the
/// cursor only once the whole batch is enqueued. A stale cursor switches the
/// account to the full-resync path instead of retrying blindly.
pub async fn handle_sync_account(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: SyncPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid sync.account payload: {err}")))?;

    let account_repo = AccountRepository::new(dispatcher.db.clone());
    let account = account_repo
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| map_account_error("load account", err))?;

    let queue = dispatcher.queue();

    if account.state.sync_status == SyncStatus::NeedsResync {
        return trigger_resync(&queue, &payload.account_id).await;
    }

    let Some(cursor) = account.state.history_cursor.clone() else {
        // Never synced: only a full enumeration can establish a baseline.
        info!(account_id = %payload.account_id, "no cursor yet, requesting full resync");
        mark_needs_resync(&account_repo, &payload.account_id).await?;
        return trigger_resync(&queue, &payload.account_id).await;
    };

    let batch = match dispatcher
        .provider
        .fetch_changes(&account, &cursor)
        .await
    {
        Ok(batch) => batch,
        Err(ProviderError::StaleCursor) => {
            info!(
                account_id = %payload.account_id,
                cursor = %cursor,
                "cursor reported stale, requesting full resync"
            );
            mark_needs_resync(&account_repo, &payload.account_id).await?;
            return trigger_resync(&queue, &payload.account_id).await;
        }
        Err(err) => return Err(map_provider_error("fetch_changes", err)),
    };

    let change_count = batch.changes.len();
    for change in &batch.changes {
        match change {
            ChangeRecord::MessageAdded {
                provider_message_id,
                provider_thread_id,
            } => {
                enqueue_ingest(
                    &queue,
                    &payload.account_id,
                    provider_message_id,
                    provider_thread_id,
                )
                .await?;
            }
        }
    }

    // Only after the full change set is enqueued may the watermark move; a
    // crash before this point re-runs the batch, and every step above is
    // idempotent.
    match account_repo
        .advance_cursor(&payload.account_id, &batch.new_cursor)
        .await
    {
        Ok(_) => {}
        Err(AccountError::CursorRegression {
            current, proposed, ..
        }) => {
            warn!(
                account_id = %payload.account_id,
                current = %current,
                proposed = %proposed,
                "provider returned older watermark, keeping current cursor"
            );
        }
        Err(err) => return Err(map_account_error("advance cursor", err)),
    }

    info!(
        account_id = %payload.account_id,
        from_cursor = %cursor,
        new_cursor = %batch.new_cursor,
        changes = change_count,
        "incremental sync complete"
    );

    Ok(())
}

async fn enqueue_ingest(
    queue: &JobQueue,
    account_id: &str,
    provider_message_id: &str,
    provider_thread_id: &str,
) -> Result<(), JobError> {
    let payload = json!({
        "account_id": account_id,
        "provider_message_id": provider_message_id,
        "provider_thread_id": provider_thread_id,
    });
    let key = format!("{JOB_TYPE_INGEST_MESSAGE}:{account_id}:{provider_message_id}");

    queue
        .enqueue_idempotent(
            JOB_TYPE_INGEST_MESSAGE,
            payload,
            EnqueueOptions {
                lane: Some(account_lane(account_id)),
                idempotency_key: Some(key),
                priority: 1,
                not_before: None,
            },
        )
        .await
        .map_err(|err| JobError::retryable(format!("enqueue ingest job failed: {err}")))?;
    debug!(account_id, provider_message_id, "ingest job ensured");
    Ok(())
}

async fn mark_needs_resync(
    account_repo: &AccountRepository,
    account_id: &str,
) -> Result<(), JobError> {
    let account = account_repo
        .get_by_id(account_id)
        .await
        .map_err(|err| map_account_error("reload account", err))?;
    let mut state = account.state.clone();
    state.sync_status = SyncStatus::NeedsResync;
    state.history_cursor = None; // Stale watermark is useless now.
    account_repo
        .update_state(account_id, &state)
        .await
        .map_err(|err| map_account_error("mark needs_resync", err))?;
    Ok(())
}

async fn trigger_resync(queue: &JobQueue, account_id: &str) -> Result<(), JobError> {
    let payload = json!({ "account_id": account_id });
    let key = format!("{JOB_TYPE_RESYNC_ACCOUNT}:{account_id}:fallback");

    match queue
        .enqueue(
            JOB_TYPE_RESYNC_ACCOUNT,
            payload,
            EnqueueOptions {
                lane: Some(account_lane(account_id)),
                idempotency_key: Some(key),
                priority: -10,
                not_before: None,
            },
        )
        .await
    {
        Ok(_) => info!(account_id, "resync job enqueued"),
        Err(crate::queue::QueueError::DuplicateIdempotency { .. }) => {
            debug!(account_id, "resync job already enqueued");
        }
        Err(err) => {
            return Err(JobError::retryable(format!("enqueue resync: {err}")));
        }
    }
    Ok(())
}
