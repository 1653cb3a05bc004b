//! Unified error handling for dibd.
//!
//! Each collaborator owns its own error enum ([`DiscordError`],
//! [`IrcError`], [`MappingError`], [`ConfigError`]); [`BridgeError`] is the
//! umbrella the control surface and startup path return.
//!
//! Most failures never reach a caller: lookup misses and send failures are
//! logged where they happen and the message is dropped.

use thiserror::Error;

pub use crate::config::{ConfigError, ValidationError};
pub use crate::discord::DiscordError;
pub use crate::irc::IrcError;
pub use crate::mapping::MappingError;

/// The router loop has stopped and no longer accepts events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message router is not running")]
pub struct RouterClosed;

/// Errors surfaced by the bridge control surface and startup.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Discord(#[from] DiscordError),

    #[error(transparent)]
    Irc(#[from] IrcError),

    #[error(transparent)]
    RouterClosed(#[from] RouterClosed),

    #[error("bridge is already open")]
    AlreadyOpen,
}

impl BridgeError {
    /// Static label for structured logging.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Mapping(_) => "mapping",
            Self::Discord(_) => "discord",
            Self::Irc(_) => "irc",
            Self::RouterClosed(_) => "router_closed",
            Self::AlreadyOpen => "already_open",
        }
    }
}

impl From<Vec<ValidationError>> for BridgeError {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_joined() {
        let err = BridgeError::from(vec![
            ValidationError::MissingDiscordToken,
            ValidationError::NoChannelMappings,
        ]);
        assert_eq!(err.error_code(), "validation");
        let text = err.to_string();
        assert!(text.contains("discord.token is required"));
        assert!(text.contains("; "));
    }
}
