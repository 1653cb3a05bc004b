//! Core configuration types and loading.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Discord channel id -> IRC channel (optionally `"#chan key"`).
pub type ChannelMappings = BTreeMap<String, String>;

/// Bridge configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Discord credentials and guild.
    pub discord: DiscordConfig,
    /// IRC network settings.
    pub irc: IrcConfig,
    /// Bridge behaviour.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Bridged channel pairs.
    #[serde(default)]
    pub channel_mappings: ChannelMappings,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// `[discord]`
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    /// Bot token (without the `Bot ` prefix).
    pub token: String,
    /// Guild whose channels are bridged.
    pub guild_id: String,
}

/// `[irc]`
#[derive(Debug, Clone, Deserialize)]
pub struct IrcConfig {
    /// Server address, `host:port`.
    pub server: String,
    /// Connect with TLS.
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Skip certificate verification (self-signed test networks only).
    #[serde(default)]
    pub insecure: bool,
    /// WEBIRC password; when set each session presents a per-user host.
    #[serde(default)]
    pub webirc_password: Option<String>,
    /// Nickname of the shared listener connection.
    #[serde(default = "default_listener_name")]
    pub listener_name: String,
    /// Appended to every Discord user's IRC nickname.
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Server nickname length limit.
    #[serde(default = "default_nick_max_len")]
    pub nick_max_len: usize,
}

/// `[bridge]`
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Verbose relay logging.
    #[serde(default)]
    pub debug: bool,
    /// Wait after a rename-triggered quit before reconnecting (ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Close sessions not pulsed for this long (seconds, 0 = never).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Per-session outbound queue capacity.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
    /// Upper bound on a single Discord post (ms).
    #[serde(default = "default_post_timeout_ms")]
    pub post_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            settle_delay_ms: default_settle_delay_ms(),
            cooldown_secs: default_cooldown_secs(),
            session_queue: default_session_queue(),
            post_timeout_ms: default_post_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// `None` when idle teardown is disabled.
    pub fn cooldown(&self) -> Option<Duration> {
        (self.cooldown_secs > 0).then(|| Duration::from_secs(self.cooldown_secs))
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }
}
