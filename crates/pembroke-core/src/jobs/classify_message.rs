use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::classifications::{ClassificationRepository, NewClassification};
use crate::messages::{MessageError, MessageRepository};
use crate::queue::EnqueueOptions;
use crate::{Job, JobError};

use super::{JOB_TYPE_DECIDE_MESSAGE, JobDispatcher, account_lane, map_ai_error};

#[derive(Debug, Deserialize)]
struct ClassifyPayload {
    account_id: String,
    provider_message_id: String,
}

/// Run the classifier collaborator once per message and chain into the
/// decision step. An already-classified message skips the collaborator call
/// entirely, so retries and resync-driven re-enqueues stay cheap.
pub async fn handle_classify_message(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: ClassifyPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid classify.message payload: {err}")))?;

    let messages = MessageRepository::new(dispatcher.db.clone());
    let message = match messages
        .get_by_provider_id(&payload.account_id, &payload.provider_message_id)
        .await
    {
        Ok(message) => message,
        // Ingest may still be in flight on the resync path.
        Err(MessageError::NotFound(id)) => {
            return Err(JobError::retryable(format!("message not stored yet: {id}")));
        }
        Err(err) => return Err(JobError::retryable(format!("load message: {err}"))),
    };

    let classifications = ClassificationRepository::new(dispatcher.db.clone());
    let already_classified = classifications
        .exists(&message.id)
        .await
        .map_err(|err| JobError::retryable(format!("check classification: {err}")))?;

    if !already_classified {
        let outcome = dispatcher
            .classifier
            .classify(&message)
            .await
            .map_err(|err| map_ai_error("classify", err))?;

        let (classification, created) = classifications
            .create_or_get(NewClassification {
                message_id: message.id.clone(),
                category: outcome.category,
                urgency: outcome.urgency,
                safe_to_reply: outcome.safe_to_reply,
                confidence: outcome.confidence,
                reasoning: outcome.reasoning,
                model_used: outcome.model_used,
                tokens_used: outcome.tokens_used,
            })
            .await
            .map_err(|err| JobError::retryable(format!("store classification: {err}")))?;

        info!(
            account_id = %payload.account_id,
            message_id = %message.id,
            category = classification.category.as_str(),
            urgency = classification.urgency.as_str(),
            confidence = classification.confidence,
            created,
            "message classified"
        );
    }

    let key = format!(
        "{JOB_TYPE_DECIDE_MESSAGE}:{}:{}",
        payload.account_id, payload.provider_message_id
    );
    dispatcher
        .queue()
        .enqueue_idempotent(
            JOB_TYPE_DECIDE_MESSAGE,
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
        .map_err(|err| JobError::retryable(format!("enqueue decide failed: {err}")))?;

    Ok(())
}
