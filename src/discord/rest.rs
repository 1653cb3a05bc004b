//! Discord REST (API v10) client.
//!
//! Covers what the bridge needs: user/member lookup, posting, DM channel
//! creation and per-user channel visibility. Guild roles and channel
//! overwrites are cached briefly since visibility is asked for on every
//! session connect.

use super::{DiscordError, Identity};
use dashmap::DashMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

pub const API_BASE: &str = "https://discord.com/api/v10";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const GUILD_CACHE_TTL: Duration = Duration::from_secs(60);

/// Discord permission bits and overwrite evaluation.
pub mod permissions {
    use super::{ChannelData, GuildData, Overwrite};

    pub const ADMINISTRATOR: u64 = 1 << 3;
    pub const VIEW_CHANNEL: u64 = 1 << 10;
    pub const ALL: u64 = u64::MAX;

    const OVERWRITE_ROLE: u8 = 0;
    const OVERWRITE_MEMBER: u8 = 1;

    /// Guild-level permissions for a member.
    pub fn base(guild: &GuildData, user_id: &str, member_roles: &[String]) -> u64 {
        if guild.owner_id == user_id {
            return ALL;
        }
        let mut perms = guild
            .roles
            .iter()
            .filter(|r| r.id == guild.id || member_roles.contains(&r.id))
            .fold(0, |acc, r| acc | r.permissions);
        if perms & ADMINISTRATOR != 0 {
            perms = ALL;
        }
        perms
    }

    /// Apply a channel's overwrites on top of `base`.
    ///
    /// Order: @everyone, then the union of role overwrites, then the
    /// member's own overwrite.
    pub fn channel(
        base: u64,
        guild_id: &str,
        channel: &ChannelData,
        user_id: &str,
        member_roles: &[String],
    ) -> u64 {
        if base & ADMINISTRATOR != 0 {
            return ALL;
        }
        let mut perms = base;

        if let Some(everyone) = find(channel, OVERWRITE_ROLE, guild_id) {
            perms &= !everyone.deny;
            perms |= everyone.allow;
        }

        let (allow, deny) = channel
            .permission_overwrites
            .iter()
            .filter(|o| o.kind == OVERWRITE_ROLE && member_roles.contains(&o.id))
            .fold((0, 0), |(a, d), o| (a | o.allow, d | o.deny));
        perms &= !deny;
        perms |= allow;

        if let Some(member) = find(channel, OVERWRITE_MEMBER, user_id) {
            perms &= !member.deny;
            perms |= member.allow;
        }
        perms
    }

    fn find<'a>(channel: &'a ChannelData, kind: u8, id: &str) -> Option<&'a Overwrite> {
        channel
            .permission_overwrites
            .iter()
            .find(|o| o.kind == kind && o.id == id)
    }

    pub fn can_view(perms: u64) -> bool {
        perms & VIEW_CHANNEL != 0
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Permission strings arrive as decimal strings.
fn de_permissions<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    raw.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserData {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: String,
    #[serde(default)]
    pub bot: bool,
}

impl UserData {
    pub fn into_identity(self, nick: Option<String>) -> Identity {
        Identity {
            id: self.id,
            username: self.username,
            discriminator: self.discriminator,
            nick: nick.unwrap_or_default(),
            bot: self.bot,
            online: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberData {
    pub user: Option<UserData>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleData {
    pub id: String,
    #[serde(deserialize_with = "de_permissions")]
    pub permissions: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildData {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub roles: Vec<RoleData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Overwrite {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(deserialize_with = "de_permissions")]
    pub allow: u64,
    #[serde(deserialize_with = "de_permissions")]
    pub deny: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelData {
    pub id: String,
    #[serde(default)]
    pub permission_overwrites: Vec<Overwrite>,
}

#[derive(Debug, Clone)]
struct CachedGuild {
    guild: GuildData,
    channels: Vec<ChannelData>,
    expires_at: Instant,
}

// =============================================================================
// Client
// =============================================================================

pub struct RestClient {
    http: reqwest::Client,
    base: String,
    token: String,
    guild_id: String,
    guild_cache: DashMap<String, CachedGuild>,
}

impl RestClient {
    pub fn new(token: &str, guild_id: &str) -> Result<Self, DiscordError> {
        Self::with_base(API_BASE, token, guild_id)
    }

    /// Client against a different API root.
    pub fn with_base(base: &str, token: &str, guild_id: &str) -> Result<Self, DiscordError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("DiscordBot (dibd, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            guild_id: guild_id.to_string(),
            guild_cache: DashMap::new(),
        })
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base)
    }

    fn check(route: &str, resp: reqwest::Response) -> Result<reqwest::Response, DiscordError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(DiscordError::Status {
                status: status.as_u16(),
                route: route.to_string(),
            })
        }
    }

    async fn get<T: DeserializeOwned>(&self, route: &str) -> Result<T, DiscordError> {
        let resp = self
            .http
            .get(self.url(route))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await?;
        Ok(Self::check(route, resp)?.json().await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        route: &str,
        body: serde_json::Value,
    ) -> Result<T, DiscordError> {
        let resp = self
            .http
            .post(self.url(route))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(route, resp)?.json().await?)
    }

    /// User plus guild nickname. Falls back to the bare user when the
    /// member lookup fails.
    pub async fn user(&self, id: &str) -> Result<Identity, DiscordError> {
        let route = format!("/guilds/{}/members/{id}", self.guild_id);
        match self.get::<MemberData>(&route).await {
            Ok(MemberData {
                user: Some(user),
                nick,
                ..
            }) => return Ok(user.into_identity(nick)),
            Ok(_) => {}
            Err(e) => debug!(%id, error = %e, "Member lookup failed, trying user"),
        }

        match self.get::<UserData>(&format!("/users/{id}")).await {
            Ok(user) => Ok(user.into_identity(None)),
            Err(DiscordError::Status { status: 404, .. }) => {
                Err(DiscordError::UnknownUser(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), DiscordError> {
        let body = json!({
            "content": text,
            "allowed_mentions": { "parse": [] },
        });
        self.post::<serde_json::Value>(&format!("/channels/{channel_id}/messages"), body)
            .await?;
        Ok(())
    }

    pub async fn open_dm_channel(&self, user_id: &str) -> Result<String, DiscordError> {
        let channel: ChannelData = self
            .post("/users/@me/channels", json!({ "recipient_id": user_id }))
            .await?;
        Ok(channel.id)
    }

    async fn guild(&self) -> Result<(GuildData, Vec<ChannelData>), DiscordError> {
        if let Some(cached) = self.guild_cache.get(&self.guild_id)
            && cached.expires_at > Instant::now()
        {
            return Ok((cached.guild.clone(), cached.channels.clone()));
        }

        let guild: GuildData = self.get(&format!("/guilds/{}", self.guild_id)).await?;
        let channels: Vec<ChannelData> = self
            .get(&format!("/guilds/{}/channels", self.guild_id))
            .await?;
        self.guild_cache.insert(
            self.guild_id.clone(),
            CachedGuild {
                guild: guild.clone(),
                channels: channels.clone(),
                expires_at: Instant::now() + GUILD_CACHE_TTL,
            },
        );
        Ok((guild, channels))
    }

    pub async fn visible_channels(
        &self,
        user_id: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, DiscordError> {
        let (guild, channels) = self.guild().await?;
        let member: MemberData = self
            .get(&format!("/guilds/{}/members/{user_id}", self.guild_id))
            .await?;
        Ok(visible(&guild, &channels, user_id, &member.roles, candidates))
    }
}

/// Candidates the member may view, in candidate order.
pub fn visible(
    guild: &GuildData,
    channels: &[ChannelData],
    user_id: &str,
    member_roles: &[String],
    candidates: &[String],
) -> Vec<String> {
    let base = permissions::base(guild, user_id, member_roles);
    candidates
        .iter()
        .filter(|id| {
            channels.iter().find(|c| &c.id == *id).is_some_and(|channel| {
                permissions::can_view(permissions::channel(
                    base,
                    &guild.id,
                    channel,
                    user_id,
                    member_roles,
                ))
            })
        })
        .cloned()
        .collect()
}
