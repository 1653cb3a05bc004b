//! Owned IRC messages.
//!
//! The grammar handled here is RFC 1459 plus an optional IRCv3 tag block.
//! Tags are skipped: the bridge never requests capabilities that produce
//! them, but some networks send `@time` regardless.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Message source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    /// `:irc.example.net`
    ServerName(String),
    /// `:nick!user@host`; user and host may be empty.
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix without the leading colon.
    pub fn new_from_str(s: &str) -> Self {
        match s.split_once('!') {
            Some((nick, rest)) => {
                let (user, host) = rest.split_once('@').unwrap_or((rest, ""));
                Prefix::Nickname(nick.to_string(), user.to_string(), host.to_string())
            }
            None => match s.split_once('@') {
                Some((nick, host)) => {
                    Prefix::Nickname(nick.to_string(), String::new(), host.to_string())
                }
                // A bare token with a dot is a server; otherwise a nick.
                None if s.contains('.') => Prefix::ServerName(s.to_string()),
                None => Prefix::Nickname(s.to_string(), String::new(), String::new()),
            },
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => f.write_str(name),
            Prefix::Nickname(nick, user, host) => {
                f.write_str(nick)?;
                if !user.is_empty() {
                    write!(f, "!{user}")?;
                }
                if !host.is_empty() {
                    write!(f, "@{host}")?;
                }
                Ok(())
            }
        }
    }
}

/// A single IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source, if the line carried one.
    pub prefix: Option<Prefix>,
    /// Command verb or three-digit numeric, uppercased.
    pub command: String,
    /// Parameters; the trailing parameter is stored without its colon.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a command and parameters.
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: None,
            command: command.to_ascii_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// `PRIVMSG target :text`
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", [target, text])
    }

    /// `NOTICE target :text`
    pub fn notice(target: &str, text: &str) -> Self {
        Self::new("NOTICE", [target, text])
    }

    /// `NICK nick`
    pub fn nick(nick: &str) -> Self {
        Self::new("NICK", [nick])
    }

    /// `USER user 0 * :realname`
    pub fn user(user: &str, realname: &str) -> Self {
        Self::new("USER", [user, "0", "*", realname])
    }

    /// `PONG :token`
    pub fn pong(token: &str) -> Self {
        Self::new("PONG", [token])
    }

    /// `QUIT [:reason]`
    pub fn quit(reason: Option<&str>) -> Self {
        Self::new("QUIT", reason)
    }

    /// Attach a source prefix.
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Nick of the sender when the prefix is a user mask.
    pub fn source_nick(&self) -> Option<&str> {
        match &self.prefix {
            Some(Prefix::Nickname(nick, _, _)) => Some(nick),
            _ => None,
        }
    }

    /// Parameter at `idx`.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// True when the command is a numeric reply with the given code.
    pub fn is_numeric(&self, code: u16) -> bool {
        self.command.len() == 3 && self.command.parse::<u16>() == Ok(code)
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut rest = line.trim_end_matches(&['\r', '\n'][..]);

        if let Some(tagged) = rest.strip_prefix('@') {
            rest = tagged
                .split_once(' ')
                .map(|(_, r)| r)
                .ok_or_else(|| ProtocolError::InvalidMessage(line.to_string()))?;
        }
        rest = rest.trim_start_matches(' ');

        let prefix = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (raw, r) = prefixed
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::InvalidMessage(line.to_string()))?;
                rest = r.trim_start_matches(' ');
                Some(Prefix::new_from_str(raw))
            }
            None => None,
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((cmd, r)) => (cmd, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ProtocolError::InvalidMessage(line.to_string()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, r)) => {
                    params.push(p.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (idx, param) in self.params.iter().enumerate() {
            let needs_colon =
                idx == last && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if needs_colon {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}
