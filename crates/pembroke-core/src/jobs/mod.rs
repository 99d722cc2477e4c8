use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::accounts::AccountError;
use crate::ai::{AiError, Classifier, Drafter};
use crate::audit::AuditLog;
use crate::db::Database;
use crate::decisions::{DecisionPipeline, PipelineError};
use crate::provider::{MailProvider, ProviderError};
use crate::queue::JobQueue;
use crate::worker::{JobError, JobExecutor};
use crate::Job;

mod classify_message;
mod decide_message;
mod ingest_message;
mod renew_watch;
mod resync_account;
mod send_draft;
mod sync_account;

use classify_message::handle_classify_message;
use decide_message::handle_decide_message;
use ingest_message::handle_ingest_message;
use renew_watch::handle_renew_watch;
use resync_account::handle_resync_account;
use send_draft::handle_send_draft;
use sync_account::handle_sync_account;

pub const JOB_TYPE_SYNC_ACCOUNT: &str = "sync.account";
pub const JOB_TYPE_RESYNC_ACCOUNT: &str = "resync.account";
pub const JOB_TYPE_INGEST_MESSAGE: &str = "ingest.message";
pub const JOB_TYPE_CLASSIFY_MESSAGE: &str = "classify.message";
pub const JOB_TYPE_DECIDE_MESSAGE: &str = "decide.message";
pub const JOB_TYPE_SEND_DRAFT: &str = "send.draft";
pub const JOB_TYPE_RENEW_WATCH: &str = "renew.watch";

/// Every job for one account shares this lane, which is what serializes the
/// account's sync work.
pub fn account_lane(account_id: &str) -> String {
    format!("account:{account_id}")
}

#[derive(Clone)]
pub struct JobDispatcher {
    pub db: Database,
    pub provider: Arc<dyn MailProvider>,
    pub classifier: Arc<dyn Classifier>,
    pub drafter: Arc<dyn Drafter>,
    pub audit: AuditLog,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        provider: Arc<dyn MailProvider>,
        classifier: Arc<dyn Classifier>,
        drafter: Arc<dyn Drafter>,
    ) -> Self {
        let audit = AuditLog::new(db.clone());
        Self {
            db,
            provider,
            classifier,
            drafter,
            audit,
        }
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.db.clone())
    }

    pub fn pipeline(&self) -> DecisionPipeline {
        DecisionPipeline::new(
            self.db.clone(),
            self.queue(),
            self.drafter.clone(),
            self.audit.clone(),
        )
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job) -> Result<(), JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_SYNC_ACCOUNT => handle_sync_account(self, job).await,
            JOB_TYPE_RESYNC_ACCOUNT => handle_resync_account(self, job).await,
            JOB_TYPE_INGEST_MESSAGE => handle_ingest_message(self, job).await,
            JOB_TYPE_CLASSIFY_MESSAGE => handle_classify_message(self, job).await,
            JOB_TYPE_DECIDE_MESSAGE => handle_decide_message(self, job).await,
            JOB_TYPE_SEND_DRAFT => handle_send_draft(self, job).await,
            JOB_TYPE_RENEW_WATCH => handle_renew_watch(self, job).await,
            other => Err(JobError::Fatal(format!("unknown job type: {other}"))),
        }
    }
}

pub(crate) fn map_provider_error(context: &str, err: ProviderError) -> JobError {
    match err {
        // Stale cursors are handled where they occur (sync triggers a full
        // resync); anywhere else they indicate a logic bug.
        ProviderError::StaleCursor => JobError::Fatal(format!("{context}: unexpected stale cursor")),
        ProviderError::RateLimited { retry_after } => {
            let message = format!("{context}: rate limited");
            match retry_after {
                Some(delay) => JobError::retryable_after(message, delay),
                None => JobError::retryable(message),
            }
        }
        ProviderError::Timeout => JobError::retryable(format!("{context}: timeout")),
        ProviderError::Unauthorized => JobError::retryable(format!("{context}: unauthorized")),
        ProviderError::Transport(detail) => {
            JobError::retryable(format!("{context}: transport error {detail}"))
        }
        ProviderError::NotFound(id) => JobError::Fatal(format!("{context}: not found {id}")),
        ProviderError::InvalidRecipient(detail) => {
            JobError::Fatal(format!("{context}: invalid recipient {detail}"))
        }
    }
}

pub(crate) fn map_ai_error(context: &str, err: AiError) -> JobError {
    match err {
        AiError::RateLimited { retry_after_ms } => {
            let message = format!("{context}: rate limited");
            match retry_after_ms {
                Some(ms) => JobError::retryable_after(message, Duration::from_millis(ms)),
                None => JobError::retryable(message),
            }
        }
        AiError::Timeout => JobError::retryable(format!("{context}: timeout")),
        AiError::Provider(detail) => {
            JobError::retryable(format!("{context}: provider error {detail}"))
        }
        AiError::InvalidRequest(detail) => {
            JobError::Fatal(format!("{context}: invalid request {detail}"))
        }
    }
}

pub(crate) fn map_account_error(context: &str, err: AccountError) -> JobError {
    match err {
        AccountError::NotFound(id) => JobError::Fatal(format!("{context}: account not found {id}")),
        AccountError::CursorRegression { .. } => {
            JobError::Fatal(format!("{context}: cursor regression: {err}"))
        }
        AccountError::Database(err) => JobError::retryable(format!("{context}: db error {err}")),
        AccountError::Sql(err) => JobError::retryable(format!("{context}: db error {err}")),
        AccountError::Json(err) => JobError::Fatal(format!("{context}: decode error {err}")),
        AccountError::DateTimeParse(err) => {
            JobError::Fatal(format!("{context}: decode error {err}"))
        }
    }
}

pub(crate) fn map_pipeline_error(context: &str, err: PipelineError) -> JobError {
    match err {
        // The classifier has not caught up; defer rather than fail.
        PipelineError::ClassificationMissing(id) => JobError::retryable_after(
            format!("{context}: classification missing for {id}"),
            Duration::from_secs(30),
        ),
        PipelineError::Drafter(err) => map_ai_error(context, err),
        PipelineError::Message(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Classification(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Rule(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Decision(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Draft(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Approval(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Settings(err) => JobError::retryable(format!("{context}: {err}")),
        PipelineError::Queue(err) => JobError::retryable(format!("{context}: {err}")),
    }
}
