use serde::Deserialize;
use tracing::{info, warn};

use crate::accounts::{AccountRepository, SyncStatus};
use crate::{Job, JobError};

use super::{JobDispatcher, map_account_error, map_provider_error};

#[derive(Debug, Deserialize)]
struct RenewPayload {
    account_id: String,
}

/// Renew the provider push subscription before it lapses. On failure the
/// account falls back to polling so sync keeps making progress; the
/// scheduler keeps requesting renewal until one succeeds.
pub async fn handle_renew_watch(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: RenewPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid renew.watch payload: {err}")))?;

    let account_repo = AccountRepository::new(dispatcher.db.clone());
    let account = account_repo
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| map_account_error("load account", err))?;

    match dispatcher.provider.renew_watch(&account).await {
        Ok(expiry) => {
            let mut state = account.state.clone();
            state.watch_expiry = Some(expiry);
            if state.sync_status == SyncStatus::Polling {
                state.sync_status = SyncStatus::Normal;
            }
            account_repo
                .update_state(&account.id, &state)
                .await
                .map_err(|err| map_account_error("store watch expiry", err))?;

            info!(
                account_id = %payload.account_id,
                expiry = %expiry,
                "watch renewed"
            );
            Ok(())
        }
        Err(err) => {
            warn!(
                account_id = %payload.account_id,
                error = %err,
                "watch renewal failed, falling back to polling"
            );
            let mut state = account.state.clone();
            state.sync_status = SyncStatus::Polling;
            account_repo
                .update_state(&account.id, &state)
                .await
                .map_err(|err| map_account_error("mark polling", err))?;

            Err(map_provider_error("renew_watch", err))
        }
    }
}
