use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub worker: WorkerPoolConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl WorkerPoolConfig {
    pub fn worker_config(&self) -> crate::worker::WorkerConfig {
        crate::worker::WorkerConfig {
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: std::time::Duration::from_secs(self.heartbeat_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Seconds between poll ticks for accounts without a live push watch.
    pub poll_interval_secs: u64,
    /// Hours before `watch_expiry` at which renewal is requested.
    pub watch_renewal_window_hours: i64,
    /// Seconds between scheduler sweeps over all accounts.
    pub scheduler_tick_secs: u64,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides,
    /// and resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides();
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(concurrency) = env::var("WORKER_CONCURRENCY") {
            if let Ok(value) = concurrency.parse() {
                self.worker.concurrency = value;
            }
        }
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.paths.database)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
