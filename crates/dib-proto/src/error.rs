//! Protocol error types.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Errors raised while framing or parsing IRC lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the configured limit before a newline was seen.
    #[error("line too long: {actual} bytes (limit {limit})")]
    MessageTooLong {
        /// Bytes buffered so far.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The line could not be split into prefix/command/params.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
