//! Discord gateway (websocket) client.
//!
//! HELLO, IDENTIFY, heartbeat. Any failure after startup reconnects with a
//! fresh IDENTIFY; there is no RESUME, so events during the gap are lost.
//! Dispatches become router events:
//!
//! - `MESSAGE_CREATE` -> `UserUpdate` then `Discord`
//! - `GUILD_MEMBER_UPDATE`, `PRESENCE_UPDATE` -> `Presence`

use super::rest::{MemberData, UserData};
use super::{DiscordError, Identity};
use crate::bridge::{DiscordInbound, RouterHandle};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, error, info, warn};

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAYS: [u64; 5] = [1, 2, 5, 10, 30];

mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_PRESENCES: u64 = 1 << 8;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;

    pub const BRIDGE: u64 =
        GUILDS | GUILD_MEMBERS | GUILD_PRESENCES | GUILD_MESSAGES | MESSAGE_CONTENT;
}

mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes after which reconnecting cannot help.
const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct Payload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hello {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct Ready {
    user: UserData,
}

#[derive(Debug, Deserialize)]
struct PartialMember {
    #[serde(default)]
    nick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: UserData,
    #[serde(default)]
    member: Option<PartialMember>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    webhook_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberUpdate {
    guild_id: String,
    user: UserData,
    #[serde(default)]
    nick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartialUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PresenceUpdate {
    user: PartialUser,
    #[serde(default)]
    guild_id: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct GuildCreate {
    id: String,
    #[serde(default)]
    members: Vec<MemberData>,
    #[serde(default)]
    presences: Vec<PresenceUpdate>,
}

/// An established, identified gateway connection.
struct Connected {
    ws: Socket,
    heartbeat: Duration,
    seq: Option<u64>,
    self_id: String,
}

/// How a connected run ended.
enum Exit {
    Shutdown,
    Fatal(String),
}

/// Cache and shutdown switch shared with [`DiscordClient`](super::DiscordClient).
#[derive(Clone)]
pub struct GatewayHandle {
    identities: Arc<DashMap<String, Identity>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GatewayHandle {
    /// Last identity the gateway saw for `id`.
    pub fn cached_identity(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|i| i.value().clone())
    }

    /// Stop the gateway task.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct Gateway {
    url: String,
    token: String,
    guild_id: String,
    identities: Arc<DashMap<String, Identity>>,
    shutdown: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(token: &str, guild_id: &str) -> (Self, GatewayHandle) {
        Self::with_url(GATEWAY_URL, token, guild_id)
    }

    pub fn with_url(url: &str, token: &str, guild_id: &str) -> (Self, GatewayHandle) {
        let identities = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let gateway = Self {
            url: url.to_string(),
            token: token.to_string(),
            guild_id: guild_id.to_string(),
            identities: Arc::clone(&identities),
            shutdown,
        };
        let handle = GatewayHandle {
            identities,
            shutdown: Arc::new(shutdown_tx),
        };
        (gateway, handle)
    }

    /// Perform the first handshake, then run in the background.
    ///
    /// A failed first handshake is returned to the caller.
    pub async fn start(self, router: RouterHandle) -> Result<(), DiscordError> {
        let conn = self.handshake().await?;
        info!(user = %conn.self_id, "Connected to Discord gateway");
        let span = crate::telemetry::spans::gateway(&self.guild_id);
        tokio::spawn(self.run(conn, router).instrument(span));
        Ok(())
    }

    async fn handshake(&self) -> Result<Connected, DiscordError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake_inner())
            .await
            .map_err(|_| DiscordError::Timeout)?
    }

    async fn handshake_inner(&self) -> Result<Connected, DiscordError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;

        let hello = next_payload(&mut ws).await?;
        if hello.op != op::HELLO {
            return Err(DiscordError::Gateway(format!(
                "expected HELLO, got op {}",
                hello.op
            )));
        }
        let hello: Hello = serde_json::from_value(hello.d)?;

        let identify = json!({
            "op": op::IDENTIFY,
            "d": {
                "token": self.token,
                "intents": intents::BRIDGE,
                "properties": { "os": std::env::consts::OS, "browser": "dibd", "device": "dibd" },
            }
        });
        ws.send(WsMessage::Text(identify.to_string())).await?;

        let mut conn = Connected {
            ws,
            heartbeat: Duration::from_millis(hello.heartbeat_interval),
            seq: None,
            self_id: String::new(),
        };
        loop {
            let payload = next_payload(&mut conn.ws).await?;
            if payload.s.is_some() {
                conn.seq = payload.s;
            }
            match (payload.op, payload.t.as_deref()) {
                (op::DISPATCH, Some("READY")) => {
                    let ready: Ready = serde_json::from_value(payload.d)?;
                    conn.self_id = ready.user.id;
                    return Ok(conn);
                }
                (op::INVALID_SESSION, _) => {
                    return Err(DiscordError::Gateway("session rejected by gateway".into()));
                }
                _ => {}
            }
        }
    }

    async fn run(mut self, mut conn: Connected, router: RouterHandle) {
        loop {
            match self.drive(&mut conn, &router).await {
                Ok(Exit::Shutdown) => {
                    let _ = conn.ws.close(None).await;
                    info!("Discord gateway closed");
                    return;
                }
                Ok(Exit::Fatal(reason)) => {
                    error!(%reason, "Discord gateway closed the session for good");
                    return;
                }
                Err(e) => warn!(error = %e, "Discord gateway connection lost"),
            }

            let mut attempt = 0usize;
            conn = loop {
                let delay = Duration::from_secs(RECONNECT_DELAYS[attempt.min(RECONNECT_DELAYS.len() - 1)]);
                attempt += 1;
                tokio::select! {
                    _ = self.shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.handshake().await {
                    Ok(conn) => {
                        info!("Reconnected to Discord gateway");
                        break conn;
                    }
                    Err(e) => warn!(error = %e, attempt, "Gateway reconnect failed"),
                }
            };
        }
    }

    async fn drive(
        &mut self,
        conn: &mut Connected,
        router: &RouterHandle,
    ) -> Result<Exit, DiscordError> {
        let mut ticker = tokio::time::interval(conn.heartbeat);
        ticker.tick().await;
        let mut acked = true;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(Exit::Shutdown),
                _ = ticker.tick() => {
                    if !acked {
                        return Err(DiscordError::Gateway("heartbeat not acknowledged".into()));
                    }
                    acked = false;
                    send_heartbeat(conn).await?;
                }
                frame = conn.ws.next() => {
                    let text = match frame {
                        None => return Err(DiscordError::Closed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(frame))) => return close_exit(frame),
                        Some(Ok(_)) => continue,
                    };
                    let payload: Payload = serde_json::from_str(&text)?;
                    if payload.s.is_some() {
                        conn.seq = payload.s;
                    }
                    match payload.op {
                        op::DISPATCH => {
                            if let Some(event) = payload.t.as_deref() {
                                self.dispatch(event, payload.d, &conn.self_id, router).await;
                            }
                        }
                        op::HEARTBEAT => send_heartbeat(conn).await?,
                        op::HEARTBEAT_ACK => acked = true,
                        op::RECONNECT => return Err(DiscordError::Gateway("reconnect requested".into())),
                        op::INVALID_SESSION => return Err(DiscordError::Gateway("invalid session".into())),
                        other => debug!(op = other, "Ignoring gateway opcode"),
                    }
                }
            }
        }
    }

    fn ours(&self, guild_id: Option<&str>) -> bool {
        guild_id == Some(self.guild_id.as_str())
    }

    fn online(&self, id: &str) -> Option<bool> {
        self.identities.get(id).map(|i| i.online)
    }

    async fn dispatch(
        &self,
        event: &str,
        data: serde_json::Value,
        self_id: &str,
        router: &RouterHandle,
    ) {
        let result = match event {
            "MESSAGE_CREATE" => self.on_message(data, self_id, router).await,
            "GUILD_MEMBER_UPDATE" => self.on_member_update(data, router).await,
            "PRESENCE_UPDATE" => self.on_presence(data, router).await,
            "GUILD_CREATE" => self.on_guild_create(data),
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!(%event, error = %e, "Skipping gateway event");
        }
    }

    async fn on_message(
        &self,
        data: serde_json::Value,
        self_id: &str,
        router: &RouterHandle,
    ) -> Result<(), DiscordError> {
        let msg: MessageCreate = serde_json::from_value(data)?;
        if !self.ours(msg.guild_id.as_deref())
            || msg.author.bot
            || msg.author.id == self_id
            || msg.webhook_id.is_some()
            || msg.content.trim().is_empty()
        {
            return Ok(());
        }

        let nick = msg.member.and_then(|m| m.nick);
        let mut identity = msg.author.into_identity(nick);
        identity.online = self.online(&identity.id).unwrap_or(true);
        self.identities.insert(identity.id.clone(), identity.clone());

        let inbound = DiscordInbound {
            author_id: identity.id.clone(),
            channel_id: msg.channel_id,
            text: msg.content,
        };
        router
            .user_update(identity)
            .await
            .map_err(|_| DiscordError::Closed)?;
        router
            .discord_message(inbound)
            .await
            .map_err(|_| DiscordError::Closed)
    }

    async fn on_member_update(
        &self,
        data: serde_json::Value,
        router: &RouterHandle,
    ) -> Result<(), DiscordError> {
        let update: MemberUpdate = serde_json::from_value(data)?;
        if !self.ours(Some(&update.guild_id)) {
            return Ok(());
        }
        let mut identity = update.user.into_identity(update.nick);
        identity.online = self.online(&identity.id).unwrap_or(false);
        self.identities.insert(identity.id.clone(), identity.clone());
        router
            .presence(identity)
            .await
            .map_err(|_| DiscordError::Closed)
    }

    async fn on_presence(
        &self,
        data: serde_json::Value,
        router: &RouterHandle,
    ) -> Result<(), DiscordError> {
        let update: PresenceUpdate = serde_json::from_value(data)?;
        if !self.ours(update.guild_id.as_deref()) {
            return Ok(());
        }
        let identity = match self.identities.get_mut(&update.user.id) {
            Some(mut cached) => {
                cached.online = update.status != "offline";
                cached.clone()
            }
            None => return Ok(()),
        };
        router
            .presence(identity)
            .await
            .map_err(|_| DiscordError::Closed)
    }

    fn on_guild_create(&self, data: serde_json::Value) -> Result<(), DiscordError> {
        let guild: GuildCreate = serde_json::from_value(data)?;
        if guild.id != self.guild_id {
            return Ok(());
        }
        for member in guild.members {
            if let Some(user) = member.user {
                let identity = user.into_identity(member.nick);
                self.identities.insert(identity.id.clone(), identity);
            }
        }
        for presence in guild.presences {
            if let Some(mut cached) = self.identities.get_mut(&presence.user.id) {
                cached.online = presence.status != "offline";
            }
        }
        debug!(cached = self.identities.len(), "Loaded guild members");
        Ok(())
    }
}

async fn next_payload(ws: &mut Socket) -> Result<Payload, DiscordError> {
    loop {
        match ws.next().await {
            None => return Err(DiscordError::Closed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(WsMessage::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(DiscordError::Gateway(format!("closed during handshake: {frame:?}")));
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn send_heartbeat(conn: &mut Connected) -> Result<(), DiscordError> {
    let beat = json!({ "op": op::HEARTBEAT, "d": conn.seq });
    conn.ws.send(WsMessage::Text(beat.to_string())).await?;
    Ok(())
}

fn close_exit(frame: Option<CloseFrame<'_>>) -> Result<Exit, DiscordError> {
    let code = frame.as_ref().map(|f| u16::from(f.code));
    match code {
        Some(code) if FATAL_CLOSE_CODES.contains(&code) => Ok(Exit::Fatal(format!(
            "close code {code}: {}",
            frame.map(|f| f.reason.to_string()).unwrap_or_default()
        ))),
        _ => Err(DiscordError::Gateway(format!("closed by gateway ({code:?})"))),
    }
}
