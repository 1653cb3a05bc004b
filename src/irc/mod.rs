//! IRC transport.
//!
//! Each bridge session owns one [`IrcHandle`] and the matching event
//! receiver. [`IrcConnector::connect`] starts the transport task and
//! returns immediately; the connection itself (and any reconnects) happen
//! in the background until a quit is sent.

mod client;

pub use client::TcpConnector;

use dib_proto::{ProtocolError, wrap_action};
use std::net::Ipv6Addr;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the command channel between a session and its transport.
pub const COMMAND_QUEUE: usize = 64;

/// Errors from the IRC transport.
#[derive(Debug, Error)]
pub enum IrcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid server address '{0}'")]
    InvalidServer(String),

    #[error("irc connection is closed")]
    Closed,

    #[error("timed out")]
    Timeout,
}

/// WEBIRC gateway parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebIrc {
    pub password: String,
    pub gateway: String,
    pub hostname: String,
    pub ip: String,
}

impl WebIrc {
    /// Per-user WEBIRC block for a Discord snowflake.
    ///
    /// The address is a stable `fd00::/8` ULA built from the id so that
    /// network bans can target a single Discord user.
    pub fn for_discord_user(password: &str, user_id: &str) -> Self {
        let snowflake: u64 = user_id.parse().unwrap_or_default();
        let ip = Ipv6Addr::from((0xfd00_u128 << 112) | u128::from(snowflake));
        Self {
            password: password.to_string(),
            gateway: "discord".to_string(),
            hostname: format!("{user_id}.user.discord"),
            ip: ip.to_string(),
        }
    }
}

/// Everything needed to open one IRC connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// `host:port`.
    pub server: String,
    pub tls: bool,
    pub insecure: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub webirc: Option<WebIrc>,
    pub nick_max_len: usize,
}

/// Commands a session sends to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcCommand {
    /// A pre-formatted protocol line (no CRLF).
    Raw(String),
    Privmsg { target: String, text: String },
    Action { target: String, text: String },
    Nick(String),
    /// Quit and stop reconnecting.
    Quit(Option<String>),
}

impl IrcCommand {
    /// Wire form, for transports that speak raw lines.
    pub fn to_line(&self) -> String {
        match self {
            Self::Raw(line) => line.clone(),
            Self::Privmsg { target, text } => format!("PRIVMSG {target} :{text}"),
            Self::Action { target, text } => format!("PRIVMSG {target} :{}", wrap_action(text)),
            Self::Nick(nick) => format!("NICK {nick}"),
            Self::Quit(Some(reason)) => format!("QUIT :{reason}"),
            Self::Quit(None) => "QUIT".to_string(),
        }
    }
}

/// Events a transport reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    /// Registration finished (001). `nick` is what the server accepted.
    Ready { nick: String },
    ChannelMessage {
        channel: String,
        from: String,
        text: String,
        is_action: bool,
    },
    PrivateMessage {
        /// Server name the message arrived through.
        server: String,
        /// Full source prefix.
        source: String,
        /// Sender nickname.
        from: String,
        text: String,
    },
    /// The server changed our nickname (or confirmed a NICK).
    NickChanged { nick: String },
    /// The server refused a NICK sent after registration (433).
    NickRejected { nick: String },
    /// The link dropped; the transport is reconnecting.
    Disconnected { reason: String },
}

/// Sending half of a connection.
#[derive(Debug, Clone)]
pub struct IrcHandle {
    tx: mpsc::Sender<IrcCommand>,
}

impl IrcHandle {
    pub fn new(tx: mpsc::Sender<IrcCommand>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, cmd: IrcCommand) -> Result<(), IrcError> {
        self.tx.send(cmd).await.map_err(|_| IrcError::Closed)
    }

    pub async fn raw(&self, line: impl Into<String>) -> Result<(), IrcError> {
        self.send(IrcCommand::Raw(line.into())).await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<(), IrcError> {
        self.send(IrcCommand::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn action(&self, target: &str, text: &str) -> Result<(), IrcError> {
        self.send(IrcCommand::Action {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn nick(&self, nick: &str) -> Result<(), IrcError> {
        self.send(IrcCommand::Nick(nick.to_string())).await
    }

    pub async fn quit(&self, reason: Option<&str>) -> Result<(), IrcError> {
        self.send(IrcCommand::Quit(reason.map(str::to_string))).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Opens IRC connections.
pub trait IrcConnector: Send + Sync {
    /// Start a connection in the background.
    ///
    /// Must not block: the caller may be holding a table entry.
    fn connect(&self, params: ConnectParams) -> (IrcHandle, mpsc::Receiver<IrcEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webirc_address_is_derived_from_snowflake() {
        let webirc = WebIrc::for_discord_user("pw", "1");
        assert_eq!(webirc.ip, "fd00::1");
        assert_eq!(webirc.hostname, "1.user.discord");
        assert_eq!(webirc.gateway, "discord");

        let other = WebIrc::for_discord_user("pw", "80351110224678912");
        assert_ne!(other.ip, webirc.ip);
        assert!(other.ip.starts_with("fd00:"));
    }

    #[test]
    fn commands_format_as_lines() {
        let action = IrcCommand::Action {
            target: "#main".into(),
            text: "waves".into(),
        };
        assert_eq!(action.to_line(), "PRIVMSG #main :\x01ACTION waves\x01");
        assert_eq!(IrcCommand::Quit(None).to_line(), "QUIT");
        assert_eq!(
            IrcCommand::Quit(Some("Inactive".into())).to_line(),
            "QUIT :Inactive"
        );
    }
}
