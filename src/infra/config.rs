// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::types::RequestPriority;
use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub actions: ActionsConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission-control thresholds and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub warn_threshold: f64,
    pub throttle_threshold: f64,
    pub block_threshold: f64,
    /// Upper bound of the interpolated throttle delay.
    pub max_throttle_delay_ms: u64,
    pub bypass_priorities: Vec<RequestPriority>,
    pub decision_cache_ttl_ms: u64,
    /// Expensive model -> cheaper substitute offered on `downgrade_model`.
    pub model_downgrade_map: HashMap<String, String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_threshold: 0.8,
            throttle_threshold: 0.9,
            block_threshold: 1.0,
            max_throttle_delay_ms: 5_000,
            bypass_priorities: vec![RequestPriority::Critical],
            decision_cache_ttl_ms: 5_000,
            model_downgrade_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub enabled: bool,
    /// Seconds an open circuit waits before going half-open. 0 = manual reset only.
    pub cooldown_secs: u64,
    /// Successful probes needed in half-open before closing.
    pub half_open_successes: u32,
    pub transition_history: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 300,
            half_open_successes: 1,
            transition_history: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub task_timeout_ms: u64,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 60_000,
            max_concurrent_tasks: 5,
            max_retries: 3,
            retry_delay_ms: 300_000,
            task_timeout_ms: 30_000,
            history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub enabled: bool,
    pub default_cooldown_minutes: u32,
    pub max_actions_per_day: u32,
    pub action_retry_delay_ms: u64,
    pub history_limit: usize,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_minutes: 60,
            max_actions_per_day: 10,
            action_retry_delay_ms: 1_000,
            history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Generic HTTP webhook receiving JSON payloads.
    pub webhook_url: Option<String>,
    /// Slack-compatible incoming webhook.
    pub chat_webhook_url: Option<String>,
    pub email: Option<EmailConfig>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Recipient used when an action does not name one.
    pub default_to: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file. Defaults to the data directory.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(paths::db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold ladders that cannot be evaluated.
    pub fn validate(&self) -> anyhow::Result<()> {
        let g = &self.guard;
        if !(g.warn_threshold <= g.throttle_threshold && g.throttle_threshold <= g.block_threshold)
        {
            anyhow::bail!(
                "guard thresholds must satisfy warn <= throttle <= block (got {} / {} / {})",
                g.warn_threshold,
                g.throttle_threshold,
                g.block_threshold
            );
        }
        if g.warn_threshold < 0.0 {
            anyhow::bail!("guard.warn_threshold must be non-negative");
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            anyhow::bail!("scheduler.max_concurrent_tasks must be at least 1");
        }
        Ok(())
    }
}
