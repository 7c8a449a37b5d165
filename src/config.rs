//! Configuration loader and validator for the X → XHS/WeChat sync service.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::failure::RetryPolicy;
use crate::model::Destination;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub retry: Retry,
    pub source: Source,
    pub translator: Translator,
    pub destinations: Destinations,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub fetch_interval_seconds: u64,
    pub concurrency: usize,
    pub stage_timeout_seconds: u64,
}

/// Retry caps per stage plus the shared backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub fetch: StageRetry,
    pub translate: StageRetry,
    pub publish: StageRetry,
    pub base_delay_ms: u64,
    pub max_backoff_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRetry {
    pub max_attempts: u32,
}

/// Source platform (X / Twitter API v2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub bearer_token: String,
    pub user_ids: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Translator {
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destinations {
    pub enabled: Vec<Destination>,
    #[serde(default)]
    pub xhs: Option<Xhs>,
    #[serde(default)]
    pub wechat: Option<Wechat>,
}

/// XHS is driven through a browser-automation bridge speaking HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Xhs {
    pub bridge_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Skip items without photos instead of posting text-only notes.
    #[serde(default)]
    pub require_media: bool,
}

/// WeChat Official Account credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wechat {
    pub app_id: String,
    pub app_secret: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub thumb_media_id: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

fn default_max_results() -> u32 {
    10
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn retry_policy(&self, stage: &StageRetry) -> RetryPolicy {
        RetryPolicy::new(
            stage.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_secs(self.retry.max_backoff_seconds),
        )
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.app.fetch_interval_seconds)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.app.stage_timeout_seconds)
    }

    /// `DATABASE_URL` wins over the data_dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/rednote.db", self.app.resolved_data_dir()))
    }
}

impl App {
    /// Expands a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
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

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.fetch_interval_seconds == 0 {
        return Err(ConfigError::Invalid("app.fetch_interval_seconds must be > 0"));
    }
    if cfg.app.concurrency == 0 {
        return Err(ConfigError::Invalid("app.concurrency must be > 0"));
    }
    if cfg.app.stage_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.stage_timeout_seconds must be > 0"));
    }

    if cfg.retry.fetch.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.fetch.max_attempts must be >= 1"));
    }
    if cfg.retry.translate.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.translate.max_attempts must be >= 1"));
    }
    if cfg.retry.publish.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.publish.max_attempts must be >= 1"));
    }

    if cfg.source.bearer_token.trim().is_empty() {
        return Err(ConfigError::Invalid("source.bearer_token must be non-empty"));
    }
    if cfg.source.user_ids.iter().all(|id| id.trim().is_empty()) {
        return Err(ConfigError::Invalid("source.user_ids must list at least one account"));
    }
    if !(5..=100).contains(&cfg.source.max_results) {
        return Err(ConfigError::Invalid("source.max_results must be within 5..=100"));
    }

    if cfg.translator.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("translator.api_key must be non-empty"));
    }
    if cfg.translator.model.trim().is_empty() {
        return Err(ConfigError::Invalid("translator.model must be non-empty"));
    }

    let enabled = &cfg.destinations.enabled;
    if enabled.is_empty() {
        return Err(ConfigError::Invalid("destinations.enabled must not be empty"));
    }
    if enabled.iter().collect::<HashSet<_>>().len() != enabled.len() {
        return Err(ConfigError::Invalid("destinations.enabled contains duplicates"));
    }
    for dest in enabled {
        match dest {
            Destination::Xhs => {
                let Some(xhs) = &cfg.destinations.xhs else {
                    return Err(ConfigError::Invalid("destinations.xhs is required when xhs is enabled"));
                };
                if xhs.bridge_url.trim().is_empty() {
                    return Err(ConfigError::Invalid("destinations.xhs.bridge_url must be non-empty"));
                }
            }
            Destination::Wechat => {
                let Some(wechat) = &cfg.destinations.wechat else {
                    return Err(ConfigError::Invalid("destinations.wechat is required when wechat is enabled"));
                };
                if wechat.app_id.trim().is_empty() {
                    return Err(ConfigError::Invalid("destinations.wechat.app_id must be non-empty"));
                }
                if wechat.app_secret.trim().is_empty() {
                    return Err(ConfigError::Invalid("destinations.wechat.app_secret must be non-empty"));
                }
            }
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  fetch_interval_seconds: 1800
  concurrency: 4
  stage_timeout_seconds: 120

retry:
  fetch:
    max_attempts: 3
  translate:
    max_attempts: 3
  publish:
    max_attempts: 3
  base_delay_ms: 5000
  max_backoff_seconds: 300

source:
  bearer_token: "YOUR_X_BEARER_TOKEN"
  user_ids:
    - "44196397"
  max_results: 10

translator:
  api_key: "YOUR_OPENAI_API_KEY"
  model: "gpt-4o"

destinations:
  enabled:
    - xhs
    - wechat
  xhs:
    bridge_url: "http://127.0.0.1:8931/"
    require_media: false
  wechat:
    app_id: "YOUR_WECHAT_APP_ID"
    app_secret: "YOUR_WECHAT_APP_SECRET"
"#
}
