//! Configuration management for Fanout

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::PlatformKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub telegram: Option<TelegramConfig>,
    pub bluesky: Option<BlueskyConfig>,
    pub twitter: Option<TwitterConfig>,
    pub linkedin: Option<LinkedInConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: resolve_data_path()
                .map(|dir| dir.join("fanout.db").to_string_lossy().into_owned())
                .unwrap_or_else(|_| "~/.local/share/fanout/fanout.db".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Seconds between fetch cycles
    pub poll_interval_secs: u64,
    pub max_items_per_cycle: usize,
    /// Pause between successive platform calls for one item
    pub pacing_delay_ms: u64,
    /// Bounded wait of the worker's queue pop
    pub pop_timeout_secs: u64,
    /// How long shutdown waits for queued work to drain
    pub drain_timeout_secs: u64,
    /// Consecutive store failures before an alert is logged
    pub store_alert_threshold: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            max_items_per_cycle: 5,
            pacing_delay_ms: 2000,
            pop_timeout_secs: 5,
            drain_timeout_secs: 30,
            store_alert_threshold: 5,
        }
    }
}

impl PublisherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub max_delay_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            multiplier: 2.0,
            max_attempts: 3,
            max_delay_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-call timeout for adapter requests
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// `@channel` or a numeric chat id such as `-100123456789`
    #[serde(default)]
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlueskyConfig {
    pub enabled: bool,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub app_password: String,
    #[serde(default = "default_bluesky_service")]
    pub service: String,
}

fn default_bluesky_service() -> String {
    "https://bsky.social".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwitterConfig {
    pub enabled: bool,
    /// OAuth 2.0 user-context access token with `tweet.write`
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedInConfig {
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    /// `urn:li:person:...` or `urn:li:organization:...`
    #[serde(default)]
    pub author_urn: String,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse configuration text, apply environment overrides and validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Credentials and the database path may come from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FANOUT_DB_PATH") {
            self.database.path = path;
        }

        if let Some(telegram) = self.telegram.as_mut() {
            override_from_env(&mut telegram.bot_token, "TELEGRAM_BOT_TOKEN");
            override_from_env(&mut telegram.channel_id, "TELEGRAM_CHANNEL_ID");
        }
        if let Some(bluesky) = self.bluesky.as_mut() {
            override_from_env(&mut bluesky.handle, "BLUESKY_HANDLE");
            override_from_env(&mut bluesky.app_password, "BLUESKY_APP_PASSWORD");
        }
        if let Some(twitter) = self.twitter.as_mut() {
            override_from_env(&mut twitter.access_token, "TWITTER_ACCESS_TOKEN");
        }
        if let Some(linkedin) = self.linkedin.as_mut() {
            override_from_env(&mut linkedin.access_token, "LINKEDIN_ACCESS_TOKEN");
            override_from_env(&mut linkedin.author_urn, "LINKEDIN_AUTHOR_URN");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier".to_string(),
                reason: "must be a finite number of at least 1.0".to_string(),
            }
            .into());
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.retry.base_delay_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        Ok(())
    }

    /// Platforms that are both enabled and have credentials
    pub fn enabled_platforms(&self) -> Vec<PlatformKind> {
        PlatformKind::ALL
            .into_iter()
            .filter(|kind| self.is_platform_configured(*kind))
            .collect()
    }

    pub fn is_platform_configured(&self, kind: PlatformKind) -> bool {
        match kind {
            PlatformKind::Telegram => self
                .telegram
                .as_ref()
                .is_some_and(|c| c.enabled && !c.bot_token.is_empty() && !c.channel_id.is_empty()),
            PlatformKind::Bluesky => self
                .bluesky
                .as_ref()
                .is_some_and(|c| c.enabled && !c.handle.is_empty() && !c.app_password.is_empty()),
            PlatformKind::Twitter => self
                .twitter
                .as_ref()
                .is_some_and(|c| c.enabled && !c.access_token.is_empty()),
            PlatformKind::Linkedin => self
                .linkedin
                .as_ref()
                .is_some_and(|c| c.enabled && !c.access_token.is_empty() && !c.author_urn.is_empty()),
        }
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            telegram: Some(TelegramConfig {
                enabled: true,
                ..Default::default()
            }),
            bluesky: Some(BlueskyConfig {
                enabled: true,
                service: default_bluesky_service(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn override_from_env(field: &mut String, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            *field = value.trim().to_string();
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("fanout"))
}
