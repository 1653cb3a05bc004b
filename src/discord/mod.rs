//! Discord side of the bridge.
//!
//! The bridge core only sees [`DiscordApi`]; [`DiscordClient`] is the real
//! implementation, combining the REST client with the gateway connection.

mod gateway;
mod rest;

pub use gateway::{Gateway, GatewayHandle};
pub use rest::{RestClient, permissions};

use async_trait::async_trait;
use thiserror::Error;

/// A Discord user as the bridge needs to know it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Globally unique snowflake.
    pub id: String,
    /// Account name; a change forces a reconnect.
    pub username: String,
    /// Legacy four-digit disambiguator (`"0"` for migrated accounts).
    pub discriminator: String,
    /// Guild nickname, empty when unset.
    pub nick: String,
    pub bot: bool,
    pub online: bool,
}

impl Identity {
    /// Name shown to IRC users as the real name.
    #[inline]
    pub fn display_name(&self) -> &str {
        &self.username
    }

    /// Source text for the IRC nickname: guild nick if set, else username.
    #[inline]
    pub fn nick_source(&self) -> &str {
        if self.nick.is_empty() {
            &self.username
        } else {
            &self.nick
        }
    }
}

/// Errors from the Discord collaborator.
#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discord returned {status} for {route}")]
    Status { status: u16, route: String },

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("discord connection is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for DiscordError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// What the bridge core needs from Discord.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// Look up a user by id. No retry.
    async fn user(&self, id: &str) -> Result<Identity, DiscordError>;

    /// Post `text` to a channel. No retry.
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), DiscordError>;

    /// Open (or reuse) the DM channel with a user, returning its id.
    async fn open_dm_channel(&self, user_id: &str) -> Result<String, DiscordError>;

    /// The subset of `candidates` (Discord channel ids) the user can read.
    async fn visible_channels(
        &self,
        user_id: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, DiscordError>;

    /// Drop the Discord connection.
    async fn close(&self) -> Result<(), DiscordError>;
}

/// REST client plus gateway lifetime.
pub struct DiscordClient {
    rest: RestClient,
    gateway: GatewayHandle,
}

impl DiscordClient {
    pub fn new(rest: RestClient, gateway: GatewayHandle) -> Self {
        Self { rest, gateway }
    }
}

#[async_trait]
impl DiscordApi for DiscordClient {
    async fn user(&self, id: &str) -> Result<Identity, DiscordError> {
        if let Some(identity) = self.gateway.cached_identity(id) {
            return Ok(identity);
        }
        self.rest.user(id).await
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), DiscordError> {
        self.rest.post_message(channel_id, text).await
    }

    async fn open_dm_channel(&self, user_id: &str) -> Result<String, DiscordError> {
        self.rest.open_dm_channel(user_id).await
    }

    async fn visible_channels(
        &self,
        user_id: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, DiscordError> {
        self.rest.visible_channels(user_id, candidates).await
    }

    async fn close(&self) -> Result<(), DiscordError> {
        self.gateway.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_source_prefers_guild_nick() {
        let mut identity = Identity {
            id: "1".into(),
            username: "bob".into(),
            ..Default::default()
        };
        assert_eq!(identity.nick_source(), "bob");
        identity.nick = "Bobby".into();
        assert_eq!(identity.nick_source(), "Bobby");
        assert_eq!(identity.display_name(), "bob");
    }
}
