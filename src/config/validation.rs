//! Configuration validation.
//!
//! Validates configuration at startup (and on reload) so a bad file fails
//! loudly instead of half-working.

use super::Config;
use crate::mapping::{MappingError, MappingTable};
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("discord.token is required")]
    MissingDiscordToken,
    #[error("discord.guild_id is required")]
    MissingGuildId,
    #[error("irc.server must be host:port, got '{0}'")]
    InvalidServer(String),
    #[error("irc.listener_name is required")]
    MissingListenerName,
    #[error("irc.suffix '{suffix}' leaves no room in a {max_len}-character nickname")]
    SuffixTooLong { suffix: String, max_len: usize },
    #[error("channel_mappings is empty")]
    NoChannelMappings,
    #[error("channel_mappings: {0}")]
    Mapping(#[from] MappingError),
    #[error("bridge.session_queue must be at least 1")]
    ZeroQueue,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.discord.token.trim().is_empty() {
        errors.push(ValidationError::MissingDiscordToken);
    }
    if config.discord.guild_id.trim().is_empty() {
        errors.push(ValidationError::MissingGuildId);
    }

    let server_ok = config
        .irc
        .server
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !server_ok {
        errors.push(ValidationError::InvalidServer(config.irc.server.clone()));
    }

    if config.irc.listener_name.trim().is_empty() {
        errors.push(ValidationError::MissingListenerName);
    }
    if config.irc.suffix.len() >= config.irc.nick_max_len {
        errors.push(ValidationError::SuffixTooLong {
            suffix: config.irc.suffix.clone(),
            max_len: config.irc.nick_max_len,
        });
    }

    if config.channel_mappings.is_empty() {
        errors.push(ValidationError::NoChannelMappings);
    } else if let Err(e) = MappingTable::from_config(&config.channel_mappings) {
        errors.push(e.into());
    }

    if config.bridge.session_queue == 0 {
        errors.push(ValidationError::ZeroQueue);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(body: &str) -> Config {
        toml::from_str(body).unwrap()
    }

    #[test]
    fn valid_config_passes() {
        let cfg = config(
            r##"
            [discord]
            token = "t"
            guild_id = "1"
            [irc]
            server = "irc.example.net:6667"
            [channel_mappings]
            "10" = "#main"
            "##,
        );
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn collects_every_problem() {
        let cfg = config(
            r##"
            [discord]
            token = ""
            guild_id = ""
            [irc]
            server = "no-port"
            suffix = "~discord-user-suffix"
            nick_max_len = 9
            [bridge]
            session_queue = 0
            "##,
        );
        let errors = validate(&cfg).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::MissingDiscordToken)));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::MissingGuildId)));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidServer(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::SuffixTooLong { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::NoChannelMappings)));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ZeroQueue)));
    }

    #[test]
    fn rejects_duplicate_irc_channels() {
        let cfg = config(
            r##"
            [discord]
            token = "t"
            guild_id = "1"
            [irc]
            server = "irc.example.net:6667"
            [channel_mappings]
            "10" = "#main"
            "11" = "#Main"
            "##,
        );
        let errors = validate(&cfg).unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::Mapping(MappingError::DuplicateIrc(_))]
        ));
    }
}
