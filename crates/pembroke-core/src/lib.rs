pub mod accounts;
pub mod ai;
pub mod approvals;
pub mod audit;
pub mod classifications;
pub mod config;
pub mod db;
pub mod decisions;
pub mod drafts;
pub mod jobs;
pub mod messages;
pub mod migrations;
pub mod provider;
pub mod queue;
pub mod rules;
pub mod scheduler;
pub mod sending;
pub mod settings;
pub mod telemetry;
pub mod threads;
pub mod worker;

pub use config::Config;
pub use db::Database;
pub use queue::{Job, JobQueue, JobState};
pub use telemetry::init_logging;
pub use worker::{JobError, JobExecutor, WorkerConfig, run_worker, run_worker_pool};
