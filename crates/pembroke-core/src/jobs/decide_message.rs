use serde::Deserialize;
use tracing::info;

use crate::messages::{MessageError, MessageRepository};
use crate::{Job, JobError};

use super::{JobDispatcher, map_pipeline_error};

#[derive(Debug, Deserialize)]
struct DecidePayload {
    account_id: String,
    provider_message_id: String,
}

/// Drive the decision pipeline for one message. The pipeline is idempotent
/// by message id, so duplicate invocations from sync retries are harmless.
pub async fn handle_decide_message(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: DecidePayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid decide.message payload: {err}")))?;

    let messages = MessageRepository::new(dispatcher.db.clone());
    let message = match messages
        .get_by_provider_id(&payload.account_id, &payload.provider_message_id)
        .await
    {
        Ok(message) => message,
        Err(MessageError::NotFound(id)) => {
            return Err(JobError::retryable(format!("message not stored yet: {id}")));
        }
        Err(err) => return Err(JobError::retryable(format!("load message: {err}"))),
    };

    let outcome = dispatcher
        .pipeline()
        .decide(&message.id)
        .await
        .map_err(|err| map_pipeline_error("decide", err))?;

    info!(
        account_id = %payload.account_id,
        message_id = %message.id,
        decision_id = %outcome.decision.id,
        decision_type = outcome.decision.decision_type.as_str(),
        freshly_decided = outcome.freshly_decided,
        "message triaged"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifications::{Category, ClassificationRepository, NewClassification, Urgency};
    use crate::decisions::{DecisionRepository, DecisionType};
    use crate::jobs::testing::{run_job, setup_fixture};
    use crate::jobs::JOB_TYPE_DECIDE_MESSAGE;
    use crate::messages::{Direction, NewMessage};
    use crate::queue::EnqueueOptions;
    use crate::threads::ThreadRepository;
    use chrono::Utc;
    use serde_json::json;

    async fn seed_message(fixture: &crate::jobs::testing::JobFixture) -> crate::messages::Message {
        let thread = ThreadRepository::new(fixture.dispatcher.db.clone())
            .upsert(&fixture.account.id, "thr-1", Some("Hello".into()), None)
            .await
            .expect("thread");
        MessageRepository::new(fixture.dispatcher.db.clone())
            .create_or_get(NewMessage {
                account_id: fixture.account.id.clone(),
                thread_id: thread.id,
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
                headers: json!({}),
                attachments: vec![],
                received_at: Some(Utc::now()),
            })
            .await
            .expect("message")
            .0
    }

    async fn enqueue_decide(fixture: &crate::jobs::testing::JobFixture) -> String {
        fixture
            .queue
            .enqueue(
                JOB_TYPE_DECIDE_MESSAGE,
                json!({
                    "account_id": fixture.account.id,
                    "provider_message_id": "m1",
                }),
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue decide")
    }

    #[tokio::test]
    async fn decide_creates_decision_for_classified_message() {
        let fixture = setup_fixture().await;
        let message = seed_message(&fixture).await;
        ClassificationRepository::new(fixture.dispatcher.db.clone())
            .create_or_get(NewClassification {
                message_id: message.id.clone(),
                category: Category::Spam,
                urgency: Urgency::Low,
                safe_to_reply: false,
                confidence: 0.99,
                reasoning: "spam".into(),
                model_used: "classifier-v2".into(),
                tokens_used: 50,
            })
            .await
            .expect("classification");

        let job_id = enqueue_decide(&fixture).await;
        run_job(&fixture, &job_id).await.expect("decide succeeds");

        let decision = DecisionRepository::new(fixture.dispatcher.db.clone())
            .get_by_message(&message.id)
            .await
            .expect("decision");
        assert_eq!(decision.decision_type, DecisionType::NoAction);
    }

    #[tokio::test]
    async fn missing_classification_defers_with_delay() {
        let fixture = setup_fixture().await;
        seed_message(&fixture).await;

        let job_id = enqueue_decide(&fixture).await;
        let err = run_job(&fixture, &job_id).await.expect_err("deferred");
        match err {
            JobError::Retryable { retry_after, .. } => assert!(retry_after.is_some()),
            other => panic!("expected deferral, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_message_is_retryable() {
        let fixture = setup_fixture().await;

        let job_id = enqueue_decide(&fixture).await;
        let err = run_job(&fixture, &job_id).await.expect_err("missing");
        assert!(err.is_retryable());
    }
}
