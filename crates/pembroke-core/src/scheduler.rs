use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use thiserror::Error;

use crate::accounts::{Account, AccountError, AccountRepository, SyncStatus};
use crate::config::SyncConfig;
use crate::db::Database;
use crate::jobs::{
    JOB_TYPE_RENEW_WATCH, JOB_TYPE_RESYNC_ACCOUNT, JOB_TYPE_SYNC_ACCOUNT, account_lane,
};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("account error: {0}")]
    Account(#[from] AccountError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Entry point for provider push notifications: enqueue an incremental sync
/// for the account. Keyed by the pushed watermark so a redelivered
/// notification collapses into the already-queued sync.
pub async fn notify_change(
    queue: &JobQueue,
    account_id: &str,
    watermark: &str,
) -> Result<(), QueueError> {
    let key = format!("{JOB_TYPE_SYNC_ACCOUNT}:{account_id}:push:{watermark}");
    queue
        .enqueue_idempotent(
            JOB_TYPE_SYNC_ACCOUNT,
            json!({"account_id": account_id}),
            EnqueueOptions {
                lane: Some(account_lane(account_id)),
                idempotency_key: Some(key),
                priority: 2,
                not_before: None,
            },
        )
        .await?;
    debug!(account_id, watermark, "push sync ensured");
    Ok(())
}

/// Periodic driver for the per-account sync state machines: requests watch
/// renewals inside the renewal window, schedules poll-tick syncs for
/// accounts without a live push watch, and re-queues pending full resyncs.
pub async fn run_scheduler(
    db: Database,
    queue: JobQueue,
    config: SyncConfig,
    shutdown: CancellationToken,
) {
    let tick = Duration::from_secs(config.scheduler_tick_secs.max(1));
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if let Err(err) = sweep_accounts(&db, &queue, &config).await {
            error!(error = %err, "scheduler sweep failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(tick) => {}
        }
    }
}

pub async fn sweep_accounts(
    db: &Database,
    queue: &JobQueue,
    config: &SyncConfig,
) -> Result<(), SchedulerError> {
    let accounts = AccountRepository::new(db.clone()).list_all().await?;

    for account in accounts {
        if account.state.sync_status == SyncStatus::NeedsResync {
            ensure_resync(queue, &account).await?;
        }

        if watch_needs_renewal(&account, config) {
            ensure_renewal(queue, &account).await?;
        }

        if should_poll(&account) {
            ensure_poll_sync(queue, &account, config).await?;
        }
    }

    Ok(())
}

fn watch_needs_renewal(account: &Account, config: &SyncConfig) -> bool {
    match account.state.watch_expiry {
        None => true,
        Some(expiry) => {
            let window = chrono::Duration::hours(config.watch_renewal_window_hours.max(0));
            expiry - Utc::now() <= window
        }
    }
}

/// Poll when push cannot be trusted: renewal has failed, the watch lapsed,
/// or one was never established.
fn should_poll(account: &Account) -> bool {
    if account.state.sync_status == SyncStatus::Polling {
        return true;
    }
    match account.state.watch_expiry {
        None => true,
        Some(expiry) => expiry <= Utc::now(),
    }
}

async fn ensure_resync(queue: &JobQueue, account: &Account) -> Result<(), QueueError> {
    let key = format!("{JOB_TYPE_RESYNC_ACCOUNT}:{}:fallback", account.id);
    queue
        .enqueue_idempotent(
            JOB_TYPE_RESYNC_ACCOUNT,
            json!({"account_id": account.id}),
            EnqueueOptions {
                lane: Some(account_lane(&account.id)),
                idempotency_key: Some(key),
                priority: -10,
                not_before: None,
            },
        )
        .await?;
    Ok(())
}

async fn ensure_renewal(queue: &JobQueue, account: &Account) -> Result<(), QueueError> {
    // Hour-bucketed key: at most one renewal attempt chain per account per
    // hour, while still re-requesting after earlier attempts exhausted.
    let bucket = Utc::now().timestamp() / 3600;
    let key = format!("{JOB_TYPE_RENEW_WATCH}:{}:{bucket}", account.id);
    queue
        .enqueue_idempotent(
            JOB_TYPE_RENEW_WATCH,
            json!({"account_id": account.id}),
            EnqueueOptions {
                lane: None,
                idempotency_key: Some(key),
                priority: 3,
                not_before: None,
            },
        )
        .await?;
    info!(account_id = %account.id, "watch renewal requested");
    Ok(())
}

async fn ensure_poll_sync(
    queue: &JobQueue,
    account: &Account,
    config: &SyncConfig,
) -> Result<(), QueueError> {
    let interval = config.poll_interval_secs.max(1) as i64;
    let bucket = Utc::now().timestamp() / interval;
    let key = format!("{JOB_TYPE_SYNC_ACCOUNT}:{}:poll:{bucket}", account.id);
    queue
        .enqueue_idempotent(
            JOB_TYPE_SYNC_ACCOUNT,
            json!({"account_id": account.id}),
            EnqueueOptions {
                lane: Some(account_lane(&account.id)),
                idempotency_key: Some(key),
                priority: 1,
                not_before: None,
            },
        )
        .await?;
    debug!(account_id = %account.id, "poll sync ensured");
    Ok(())
}
