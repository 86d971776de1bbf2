//! Configuration loader and validator for the GitHub→Telegram relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

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
    #[serde(default)]
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub github: GitHub,
    #[serde(default)]
    pub server: Server,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub data_dir: String,
    /// Capacity of the event channel between ingestors and the notifier.
    pub event_buffer: usize,
    /// Ledger rows older than this are removed by the retention sweep.
    pub retention_days: u32,
    pub sweep_interval_hours: u64,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            event_buffer: 100,
            retention_days: 30,
            sweep_interval_hours: 24,
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// How repository activity reaches us.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Polling,
    Webhook,
    Both,
}

impl Mode {
    pub fn polling(&self) -> bool {
        matches!(self, Mode::Polling | Mode::Both)
    }

    pub fn webhook(&self) -> bool {
        matches!(self, Mode::Webhook | Mode::Both)
    }
}

/// GitHub API and webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHub {
    /// Personal access token; empty means unauthenticated (low rate limit).
    pub token: String,
    /// Shared webhook secret; empty disables signature verification.
    pub webhook_secret: String,
    pub mode: Mode,
    pub poll_interval_seconds: u64,
    pub poll_concurrency: usize,
}

impl Default for GitHub {
    fn default() -> Self {
        Self {
            token: String::new(),
            webhook_secret: String::new(),
            mode: Mode::Polling,
            poll_interval_seconds: 300,
            poll_concurrency: 4,
        }
    }
}

impl GitHub {
    pub fn token(&self) -> Option<&str> {
        non_empty(&self.token)
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        non_empty(&self.webhook_secret)
    }
}

/// HTTP listener for the webhook endpoint and health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Server {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/watchbot.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GHBOT_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Ok(v) = std::env::var("GHBOT_GITHUB_TOKEN") {
            self.github.token = v;
        }
        if let Ok(v) = std::env::var("GHBOT_GITHUB_WEBHOOK_SECRET") {
            self.github.webhook_secret = v;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides for
/// secrets, and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.event_buffer == 0 {
        return Err(ConfigError::Invalid("app.event_buffer must be > 0"));
    }
    if cfg.app.retention_days == 0 {
        return Err(ConfigError::Invalid("app.retention_days must be > 0"));
    }
    if cfg.app.sweep_interval_hours == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_hours must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    // poll_interval_seconds below the floor is raised by the poller, not rejected.
    if cfg.github.poll_concurrency == 0 {
        return Err(ConfigError::Invalid("github.poll_concurrency must be > 0"));
    }

    if cfg.server.host.trim().is_empty() {
        return Err(ConfigError::Invalid("server.host must be non-empty"));
    }
    if cfg.server.port == 0 {
        return Err(ConfigError::Invalid("server.port must be > 0"));
    }

    Ok(())
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Example configuration covering every key.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  event_buffer: 100
  retention_days: 30
  sweep_interval_hours: 24

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

github:
  token: ""
  webhook_secret: ""
  # polling, webhook or both
  mode: "both"
  poll_interval_seconds: 300
  poll_concurrency: 4

server:
  host: "0.0.0.0"
  port: 8080
"#
}
