//! Configuration loader and validator for the media producer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::FetchMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
}

/// Producer loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Ingestion pipeline this deployment polls for.
    pub source: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    pub skipping_counter_limit: u32,
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

/// Queue gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub url: String,
    pub token: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_batch_limit() -> u32 {
    100
}

fn default_dispatch_concurrency() -> usize {
    1
}

fn default_timeout_seconds() -> u64 {
    30
}

impl App {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a sqlite file inside `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/media-producer.db", self.app.resolved_data_dir()))
    }
}

pub(crate) fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.source.trim().is_empty() {
        return Err(ConfigError::Invalid("app.source must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.batch_limit == 0 {
        return Err(ConfigError::Invalid("app.batch_limit must be > 0"));
    }
    if cfg.app.skipping_counter_limit == 0 {
        return Err(ConfigError::Invalid("app.skipping_counter_limit must be > 0"));
    }
    if cfg.app.dispatch_concurrency == 0 {
        return Err(ConfigError::Invalid("app.dispatch_concurrency must be > 0"));
    }

    if cfg.queue.url.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.url must be non-empty"));
    }
    if url::Url::parse(&cfg.queue.url).is_err() {
        return Err(ConfigError::Invalid("queue.url must be an absolute URL"));
    }
    if cfg.queue.token.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.token must be non-empty"));
    }
    if cfg.queue.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("queue.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Example configuration, also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  source: "opensea"
  poll_interval_ms: 10000
  batch_limit: 100
  fetch_mode: batch
  skipping_counter_limit: 30
  dispatch_concurrency: 1

queue:
  url: "https://queue.example.com/media-files.fifo/messages"
  token: "YOUR_QUEUE_TOKEN"
  timeout_seconds: 30
"#
}
