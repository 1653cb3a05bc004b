//! # dib-proto
//!
//! The slice of the IRC client protocol that the `dibd` bridge speaks:
//!
//! - owned [`Message`] parsing and serialization (tags are accepted and skipped)
//! - [`LineCodec`] / [`IrcCodec`] for `tokio_util::codec::Framed`
//! - RFC 1459 case mapping
//! - nickname sanitisation and validation
//! - CTCP `ACTION` wrapping
//!
//! ```rust
//! use dib_proto::Message;
//!
//! let msg: Message = ":alice!a@host PRIVMSG #rust :hello there".parse().unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.source_nick(), Some("alice"));
//! assert_eq!(msg.to_string(), ":alice!a@host PRIVMSG #rust :hello there");
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
pub mod chan;
pub mod ctcp;
pub mod error;
#[cfg(feature = "tokio")]
pub mod irc;
#[cfg(feature = "tokio")]
pub mod line;
pub mod message;
pub mod nick;

pub use self::casemap::{irc_eq, irc_to_lower};
pub use self::chan::ChannelExt;
pub use self::ctcp::{action_text, wrap_action};
pub use self::error::ProtocolError;
#[cfg(feature = "tokio")]
pub use self::irc::IrcCodec;
#[cfg(feature = "tokio")]
pub use self::line::LineCodec;
pub use self::message::{Message, Prefix};
pub use self::nick::{sanitize_nick, DEFAULT_NICK_MAX_LEN};
