use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{Job, JobQueue, JobState, QueueError};

#[derive(Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum JobError {
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retryable_after(message: impl Into<String>, delay: Duration) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_after: Some(delay),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable { .. })
    }

    fn message(&self) -> &str {
        match self {
            JobError::Retryable { message, .. } => message,
            JobError::Fatal(message) => message,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::Retryable { retry_after, .. } => *retry_after,
            JobError::Fatal(_) => None,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job) -> Result<(), JobError>;
}

pub async fn run_worker<E: JobExecutor>(
    queue: JobQueue,
    executor: E,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    run_worker_loop(queue, Arc::new(executor), config, shutdown).await
}

/// Spawn `concurrency` workers over the shared queue. Lane exclusivity is
/// enforced by `claim_next`, so accounts progress in parallel while each
/// account has at most one unit of work in flight.
pub async fn run_worker_pool<E: JobExecutor + 'static>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerConfig,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let mut handles = Vec::with_capacity(concurrency.max(1));
    for _ in 0..concurrency.max(1) {
        handles.push(tokio::spawn(run_worker_loop(
            queue.clone(),
            executor.clone(),
            config,
            shutdown.clone(),
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn run_worker_loop<E: JobExecutor>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match queue.claim_next().await {
            Ok(Some(job)) => {
                handle_job(
                    queue.clone(),
                    executor.clone(),
                    config,
                    shutdown.clone(),
                    job,
                )
                .await
            }
            Ok(None) => sleep(config.poll_interval).await,
            Err(err) => {
                error!(error = %err, "failed to claim next job");
                sleep(config.poll_interval).await;
            }
        }
    }
}

async fn handle_job<E: JobExecutor>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    job: Job,
) {
    info!(job_id = %job.id, job_type = %job.job_type, "processing job");
    let heartbeat_cancel = shutdown.child_token();
    let heartbeat_queue = queue.clone();
    let job_id = job.id.clone();
    let heartbeat_interval = config.heartbeat_interval;

    let heartbeat_task = tokio::spawn({
        let heartbeat_cancel = heartbeat_cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = sleep(heartbeat_interval) => {
                        if let Err(err) = heartbeat_queue.heartbeat(&job_id).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        }
    });

    let result = AssertUnwindSafe(executor.execute(job.clone()))
        .catch_unwind()
        .await;

    let finalize = match result {
        Ok(Ok(())) => FinalizeAction::Complete,
        Ok(Err(job_err)) => FinalizeAction::Fail {
            message: job_err.message().to_string(),
            retry: job_err.is_retryable(),
            retry_after: job_err.retry_after(),
        },
        Err(panic) => {
            let err_msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "worker panic".to_string()
            };
            warn!(job_id = %job.id, "job panicked: {err_msg}");
            FinalizeAction::Fail {
                message: err_msg,
                retry: true,
                retry_after: None,
            }
        }
    };

    if let Err(err) = finalize_job(
        queue.clone(),
        &job,
        finalize,
        &heartbeat_cancel,
        heartbeat_interval,
        shutdown,
    )
    .await
    {
        error!(job_id = %job.id, error = %err, "failed to persist job outcome");
    }

    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;
}

enum FinalizeAction {
    Complete,
    Fail {
        message: String,
        retry: bool,
        retry_after: Option<Duration>,
    },
}

async fn finalize_job(
    queue: JobQueue,
    job: &Job,
    action: FinalizeAction,
    heartbeat_cancel: &CancellationToken,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), QueueError> {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let current_state = match queue.fetch_job(&job.id).await {
            Ok(job) => job,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let backoff = finalize_backoff(heartbeat_interval);
                warn!(job_id = %job.id, attempt, error = %err, "failed to fetch job for finalize; retrying");

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {},
                    _ = heartbeat_cancel.cancelled() => return Err(err),
                }

                continue;
            }
        };
        if matches!(current_state.state, JobState::Canceled) {
            info!(job_id = %job.id, "job canceled during execution; skipping finalize");
            return Ok(());
        }

        let result = match &action {
            FinalizeAction::Complete => queue.complete(&job.id, None).await,
            FinalizeAction::Fail {
                message,
                retry,
                retry_after,
            } => {
                queue
                    .fail(&job.id, message.clone(), *retry, *retry_after)
                    .await
            }
        };

        match result {
            Ok(_) => {
                match action {
                    FinalizeAction::Complete => info!(job_id = %job.id, "job completed"),
                    FinalizeAction::Fail { retry: true, .. } => {
                        warn!(job_id = %job.id, "job failed and will retry")
                    }
                    FinalizeAction::Fail { retry: false, .. } => {
                        warn!(job_id = %job.id, "job failed permanently")
                    }
                }
                return Ok(());
            }
            Err(QueueError::NotRunning(_)) => {
                info!(job_id = %job.id, "job already moved out of running state");
                return Ok(());
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let backoff = finalize_backoff(heartbeat_interval);
                warn!(job_id = %job.id, attempt, error = %err, "failed to persist job outcome; retrying");

                // Keep heartbeat alive while retrying to avoid stale running jobs.
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {},
                    _ = heartbeat_cancel.cancelled() => return Err(err),
                }
            }
        }
    }
}

fn finalize_backoff(heartbeat_interval: Duration) -> Duration {
    let mut backoff = heartbeat_interval / 2;
    if backoff < Duration::from_millis(10) {
        backoff = Duration::from_millis(10);
    }
    if backoff > Duration::from_secs(5) {
        backoff = Duration::from_secs(5);
    }
    backoff
}
