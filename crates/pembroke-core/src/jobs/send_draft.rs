use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::accounts::AccountRepository;
use crate::drafts::{DraftError, DraftStore};
use crate::sending::deliver_draft;
use crate::{Job, JobError};

use super::{JobDispatcher, map_account_error};

#[derive(Debug, Deserialize)]
struct SendPayload {
    account_id: String,
    decision_id: String,
    draft_id: String,
}

/// Outbound delivery of an AUTO_SEND draft. Transient failures retry with
/// the queue's backoff; when the bounded attempts are exhausted, or the
/// provider rejects terminally, the unit parks and an escalation audit record
/// is raised for human follow-up. The decision itself is never mutated.
pub async fn handle_send_draft(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: SendPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid send.draft payload: {err}")))?;

    let account = AccountRepository::new(dispatcher.db.clone())
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| map_account_error("load account", err))?;

    let store = DraftStore::new(dispatcher.db.clone());
    let draft = match store.get_by_id(&payload.draft_id).await {
        Ok(draft) => draft,
        Err(DraftError::NotFound(id)) => {
            return Err(JobError::Fatal(format!("draft not found: {id}")));
        }
        Err(err) => return Err(JobError::retryable(format!("load draft: {err}"))),
    };

    if draft.is_sent {
        info!(
            draft_id = %draft.id,
            decision_id = %payload.decision_id,
            "draft already sent, skipping"
        );
        return Ok(());
    }

    match deliver_draft(
        &dispatcher.db,
        dispatcher.provider.as_ref(),
        &account,
        &draft,
        &dispatcher.audit,
    )
    .await
    {
        Ok(sent) => {
            info!(
                draft_id = %sent.id,
                decision_id = %payload.decision_id,
                account_id = %payload.account_id,
                "auto-send delivered"
            );
            Ok(())
        }
        Err(err) if err.is_transient() => {
            let exhausted = job.attempts >= job.max_attempts;
            if exhausted {
                warn!(
                    draft_id = %draft.id,
                    decision_id = %payload.decision_id,
                    attempts = job.attempts,
                    "send retries exhausted, escalating"
                );
                dispatcher.audit.record(
                    "send.escalated",
                    "decision",
                    payload.decision_id.clone(),
                    json!({
                        "draft_id": draft.id,
                        "attempts": job.attempts,
                        "error": err.to_string(),
                    }),
                );
            }
            Err(JobError::retryable(format!("send draft: {err}")))
        }
        Err(err) => {
            // Terminal rejection, e.g. invalid recipient. Decision and draft
            // stay intact; a human picks it up from here.
            dispatcher.audit.record(
                "send.escalated",
                "decision",
                payload.decision_id.clone(),
                json!({
                    "draft_id": draft.id,
                    "error": err.to_string(),
                    "terminal": true,
                }),
            );
            Err(JobError::Fatal(format!("send draft: {err}")))
        }
    }
}
