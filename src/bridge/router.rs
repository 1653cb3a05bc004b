//! The message router: one loop that owns every cross-system side effect.
//!
//! Producers (the Discord gateway, the IRC listener, sessions forwarding
//! PMs) submit [`RouterEvent`]s through a [`RouterHandle`]. The channel has a
//! single slot, so a producer waits until the loop has taken the previous
//! event. The loop never waits on an IRC session: session-bound lines go
//! into the session's own queue.

use super::envelope::{DiscordInbound, DiscordOutbound, IrcInbound, IrcOutbound};
use super::manager::ConnectionManager;
use crate::discord::{DiscordApi, Identity};
use crate::error::RouterClosed;
use crate::mapping::ChannelMapping;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// Chat message from a Discord user.
    Discord(DiscordInbound),
    /// Chat message the listener saw in a bridged channel.
    Irc(IrcInbound),
    /// Raw post to a Discord channel.
    Post(DiscordOutbound),
    /// A user is about to speak; make sure they have a session.
    UserUpdate(Identity),
    /// Member or presence change; only touches existing sessions.
    Presence(Identity),
}

/// Submission side of the router.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterEvent>,
}

impl RouterHandle {
    /// A handle and the receiver the router loop consumes.
    pub fn channel() -> (Self, mpsc::Receiver<RouterEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Hand an event to the loop, waiting until it is accepted.
    pub async fn submit(&self, event: RouterEvent) -> Result<(), RouterClosed> {
        self.tx.send(event).await.map_err(|_| RouterClosed)
    }

    pub async fn discord_message(&self, msg: DiscordInbound) -> Result<(), RouterClosed> {
        self.submit(RouterEvent::Discord(msg)).await
    }

    pub async fn irc_message(&self, msg: IrcInbound) -> Result<(), RouterClosed> {
        self.submit(RouterEvent::Irc(msg)).await
    }

    pub async fn post(&self, msg: DiscordOutbound) -> Result<(), RouterClosed> {
        self.submit(RouterEvent::Post(msg)).await
    }

    pub async fn user_update(&self, identity: Identity) -> Result<(), RouterClosed> {
        self.submit(RouterEvent::UserUpdate(identity)).await
    }

    pub async fn presence(&self, identity: Identity) -> Result<(), RouterClosed> {
        self.submit(RouterEvent::Presence(identity)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct MessageRouter {
    mapping: Arc<ChannelMapping>,
    manager: Arc<ConnectionManager>,
    discord: Arc<dyn DiscordApi>,
    post_timeout: Duration,
    debug: Arc<AtomicBool>,
}

impl MessageRouter {
    pub fn new(
        mapping: Arc<ChannelMapping>,
        manager: Arc<ConnectionManager>,
        discord: Arc<dyn DiscordApi>,
        post_timeout: Duration,
        debug: Arc<AtomicBool>,
    ) -> Self {
        Self {
            mapping,
            manager,
            discord,
            post_timeout,
            debug,
        }
    }

    /// Process events until shutdown, then run the shutdown sequence.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<RouterEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Message router started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }
        events.close();
        self.shutdown().await;
        info!("Message router stopped");
    }

    async fn dispatch(&self, event: RouterEvent) {
        match event {
            RouterEvent::Discord(msg) => self.on_discord(msg),
            RouterEvent::Irc(msg) => self.on_irc(msg).await,
            RouterEvent::Post(msg) => self.post(msg).await,
            RouterEvent::UserUpdate(identity) => self.manager.handle_user(identity),
            RouterEvent::Presence(identity) => self.manager.refresh_user(identity),
        }
    }

    fn on_discord(&self, msg: DiscordInbound) {
        let Some(irc_channel) = self.mapping.to_irc(&msg.channel_id) else {
            debug!(channel = %msg.channel_id, "Unmapped Discord channel, dropping");
            return;
        };
        if self.debug.load(Ordering::Relaxed) {
            info!(author = %msg.author_id, to = %irc_channel, text = %msg.text, "Discord -> IRC");
        }

        self.manager.pulse_id(&msg.author_id);
        for line in IrcOutbound::from_discord(&irc_channel, &msg.text) {
            self.manager.send_message(&msg.author_id, line);
        }
    }

    async fn on_irc(&self, msg: IrcInbound) {
        if self.manager.is_managed_nick(&msg.author) {
            return;
        }
        let Some(channel_id) = self.mapping.to_discord(&msg.irc_channel) else {
            debug!(channel = %msg.irc_channel, "Unmapped IRC channel, dropping");
            return;
        };
        if self.debug.load(Ordering::Relaxed) {
            info!(author = %msg.author, from = %msg.irc_channel, text = %msg.text, "IRC -> Discord");
        }

        self.post(DiscordOutbound {
            channel_id,
            text: msg.to_discord_text(),
        })
        .await;
    }

    /// Post to Discord once, bounded by the post timeout. Failures are lost.
    async fn post(&self, msg: DiscordOutbound) {
        let result = tokio::time::timeout(
            self.post_timeout,
            self.discord.post_message(&msg.channel_id, &msg.text),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(channel = %msg.channel_id, error = %e, "Discord post failed"),
            Err(_) => warn!(channel = %msg.channel_id, "Discord post timed out"),
        }
    }

    /// Discord first, then the listener, then every session.
    async fn shutdown(&self) {
        info!("Closing all connections");
        match tokio::time::timeout(self.post_timeout, self.discord.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to close Discord connection"),
            Err(_) => warn!("Timed out closing Discord connection"),
        }
        self.manager.disconnect_listener().await;
        self.manager.disconnect_all().await;
    }
}
