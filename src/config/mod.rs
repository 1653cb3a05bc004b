//! Configuration loading and management.
//!
//! - [`types`]: config struct definitions and TOML loading
//! - [`defaults`]: serde default functions
//! - [`validation`]: startup/reload checks

mod defaults;
mod types;
pub mod validation;

pub use types::{BridgeConfig, ChannelMappings, Config, ConfigError, DiscordConfig, IrcConfig};
pub use validation::{ValidationError, validate};
