//! One IRC connection standing in for one Discord identity.
//!
//! A [`Session`] is shared (`Arc`) between the manager's table and its own
//! task. The task owns the transport event receiver and the outbound queue
//! receiver, so delivery for one session never waits on another.
//!
//! # Lifecycle
//!
//! `Connecting -> Ready -> (Reconnecting -> Ready)* -> Closed`
//!
//! The outbound queue is only drained while `Ready`; anything enqueued
//! earlier waits for registration and the channel joins.

use super::envelope::{DiscordOutbound, IrcInbound, IrcOutbound};
use super::manager::ConnectionManager;
use super::router::RouterHandle;
use crate::discord::Identity;
use crate::irc::{IrcEvent, IrcHandle};
use crate::mapping::ChannelMapping;
use dib_proto::irc_eq;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// AWAY text for identities that are offline on Discord.
pub const OFFLINE_AWAY: &str = "Offline on Discord";

const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Speaks for one Discord identity.
    Puppet,
    /// The shared passive observer of every bridged channel.
    Listener,
}

/// Outcome of [`Session::update_details`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailsChange {
    Unchanged,
    /// Nick or discriminator changed; the connection was kept.
    Renicked,
    /// Display name changed; the session was torn down.
    Recreating,
}

/// Per-session collaborators, cloned from the manager at spawn time.
pub(crate) struct SessionContext {
    pub manager: Weak<ConnectionManager>,
    pub mapping: Arc<ChannelMapping>,
    pub router: RouterHandle,
}

pub struct Session {
    role: SessionRole,
    identity: RwLock<Identity>,
    nick: RwLock<String>,
    /// NICK sent but not yet confirmed by the server.
    pending_nick: Mutex<Option<String>>,
    state: RwLock<SessionState>,
    outbound: mpsc::Sender<IrcOutbound>,
    last_pulse: Mutex<Instant>,
    pm_channel: RwLock<Option<String>>,
    server: String,
    irc: IrcHandle,
}

impl Session {
    /// Build a session and start its task.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        role: SessionRole,
        identity: Identity,
        nick: String,
        server: String,
        queue: usize,
        irc: IrcHandle,
        events: mpsc::Receiver<IrcEvent>,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(queue.max(1));
        let span = crate::telemetry::spans::session(&identity.id, &nick);
        let session = Arc::new(Self {
            role,
            identity: RwLock::new(identity),
            nick: RwLock::new(nick),
            pending_nick: Mutex::new(None),
            state: RwLock::new(SessionState::Connecting),
            outbound,
            last_pulse: Mutex::new(Instant::now()),
            pm_channel: RwLock::new(None),
            server,
            irc,
        });

        let task = Arc::clone(&session);
        tokio::spawn(tracing::Instrument::instrument(
            task.run(ctx, outbound_rx, events),
            span,
        ));
        session
    }

    pub fn id(&self) -> String {
        self.identity.read().id.clone()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub(crate) fn set_nick(&self, nick: &str) {
        *self.nick.write() = nick.to_string();
    }

    pub fn pending_nick(&self) -> Option<String> {
        self.pending_nick.lock().clone()
    }

    pub(crate) fn replace_pending_nick(&self, nick: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.pending_nick.lock(), nick)
    }

    /// Clear the pending nick if it is `nick`.
    pub(crate) fn settle_pending_nick(&self, nick: &str) -> bool {
        let mut pending = self.pending_nick.lock();
        if pending.as_deref().is_some_and(|p| irc_eq(p, nick)) {
            *pending = None;
            return true;
        }
        false
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        // Closed is terminal.
        if *current != SessionState::Closed {
            *current = state;
        }
    }

    pub fn pm_channel(&self) -> Option<String> {
        self.pm_channel.read().clone()
    }

    pub fn last_pulse(&self) -> Instant {
        *self.last_pulse.lock()
    }

    pub fn pulse(&self) {
        *self.last_pulse.lock() = Instant::now();
    }

    pub fn irc(&self) -> &IrcHandle {
        &self.irc
    }

    /// Queue a line for delivery. Drops it if the queue is full.
    pub fn enqueue(&self, msg: IrcOutbound) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(
                    nick = %self.nick(),
                    channel = %msg.irc_channel,
                    "Outbound queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(msg)) => {
                debug!(channel = %msg.irc_channel, "Session task gone, dropping message");
            }
        }
    }

    /// Send an AWAY line; an empty status clears it.
    pub async fn set_away(&self, status: &str) {
        let line = if status.is_empty() {
            "AWAY".to_string()
        } else {
            format!("AWAY :{status}")
        };
        if let Err(e) = self.irc.raw(line).await {
            debug!(error = %e, "Failed to send AWAY");
        }
    }

    /// Quit the connection; does not wait longer than a couple of seconds.
    pub async fn quit(&self, reason: &str) {
        match tokio::time::timeout(QUIT_TIMEOUT, self.irc.quit(Some(reason))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(nick = %self.nick(), error = %e, "Quit on closed transport"),
            Err(_) => warn!(nick = %self.nick(), "Timed out sending QUIT"),
        }
        self.set_state(SessionState::Closed);
    }

    /// Reconcile a fresh copy of our identity.
    ///
    /// A display-name change quits this connection and hands the identity to
    /// the manager for a delayed recreate. A nick or discriminator change
    /// asks the server to rename the live connection; the stored nick only
    /// moves once the server confirms.
    pub(crate) fn update_details(
        self: &Arc<Self>,
        identity: Identity,
        manager: &ConnectionManager,
    ) -> DetailsChange {
        let current = self.identity();

        if current.display_name() != identity.display_name() {
            let reason = format!(
                "Changing real name from {} to {}",
                current.display_name(),
                identity.display_name()
            );
            info!(id = %identity.id, %reason, "Display name changed, recreating session");
            manager.detach(self);
            let session = Arc::clone(self);
            tokio::spawn(async move { session.quit(&reason).await });
            manager.schedule_recreate(identity);
            return DetailsChange::Recreating;
        }

        if current.nick == identity.nick && current.discriminator == identity.discriminator {
            self.identity.write().online = identity.online;
            return DetailsChange::Unchanged;
        }

        let old_nick = self.nick();
        let new_nick = manager.generate_nickname(&identity);
        *self.identity.write() = identity;

        if new_nick != old_nick || self.pending_nick().is_some() {
            manager.request_nick(self, new_nick);
        }
        DetailsChange::Renicked
    }

    async fn run(
        self: Arc<Self>,
        ctx: SessionContext,
        mut outbound: mpsc::Receiver<IrcOutbound>,
        mut events: mpsc::Receiver<IrcEvent>,
    ) {
        if self.role == SessionRole::Puppet {
            self.open_pm_channel(&ctx).await;
        }

        loop {
            let ready = self.state() == SessionState::Ready;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &ctx).await,
                    None => break,
                },
                Some(msg) = outbound.recv(), if ready => self.deliver(msg).await,
            }
        }

        self.set_state(SessionState::Closed);
        debug!("Session task finished");
    }

    async fn open_pm_channel(&self, ctx: &SessionContext) {
        let Some(manager) = ctx.manager.upgrade() else {
            return;
        };
        let id = self.id();
        match manager.discord().open_dm_channel(&id).await {
            Ok(channel) => *self.pm_channel.write() = Some(channel),
            Err(e) => warn!(%id, error = %e, "Could not open DM channel, PMs will not be forwarded"),
        }
    }

    async fn deliver(&self, msg: IrcOutbound) {
        let result = if msg.is_action {
            self.irc.action(&msg.irc_channel, &msg.text).await
        } else {
            self.irc.privmsg(&msg.irc_channel, &msg.text).await
        };
        if let Err(e) = result {
            warn!(channel = %msg.irc_channel, error = %e, "IRC send failed, message lost");
        }
    }

    async fn handle_event(self: &Arc<Self>, event: IrcEvent, ctx: &SessionContext) {
        match event {
            IrcEvent::Ready { nick } => self.on_ready(nick, ctx).await,
            IrcEvent::NickChanged { nick } => {
                if let Some(manager) = ctx.manager.upgrade() {
                    manager.track_nick_change(self, &nick);
                }
            }
            IrcEvent::NickRejected { nick } => {
                if let Some(manager) = ctx.manager.upgrade() {
                    manager.nick_rejected(self, &nick);
                }
            }
            IrcEvent::ChannelMessage {
                channel,
                from,
                text,
                is_action,
            } => {
                if self.role != SessionRole::Listener {
                    return;
                }
                let inbound = IrcInbound {
                    irc_channel: channel,
                    author: from,
                    text,
                    is_action,
                };
                if let Err(e) = ctx.router.irc_message(inbound).await {
                    debug!(error = %e, "Dropping IRC message");
                }
            }
            IrcEvent::PrivateMessage {
                server,
                source,
                from,
                text,
            } => {
                if self.role == SessionRole::Puppet {
                    self.on_private_message(&server, &source, &from, &text, ctx)
                        .await;
                }
            }
            IrcEvent::Disconnected { reason } => {
                info!(%reason, "IRC connection lost, transport reconnecting");
                self.set_state(SessionState::Reconnecting);
            }
        }
    }

    async fn on_ready(self: &Arc<Self>, nick: String, ctx: &SessionContext) {
        info!(%nick, server = %self.server, "Registered on IRC");
        if nick != self.nick()
            && let Some(manager) = ctx.manager.upgrade()
        {
            manager.track_nick_change(self, &nick);
        }

        let table = ctx.mapping.snapshot();
        let channels = match (self.role, ctx.manager.upgrade()) {
            (SessionRole::Puppet, Some(manager)) => manager.request_channels(&self.id()).await,
            _ => table.irc_channels(),
        };
        if let Some(join) = table.join_command(&channels)
            && let Err(e) = self.irc.raw(join).await
        {
            warn!(error = %e, "Failed to send JOIN");
        }

        if self.role == SessionRole::Puppet {
            if let Err(e) = self.irc.raw(format!("MODE {} +D", self.nick())).await {
                debug!(error = %e, "Failed to set +D");
            }
            let offline = !self.identity.read().online;
            if offline {
                self.set_away(OFFLINE_AWAY).await;
            }
        }

        self.set_state(SessionState::Ready);
    }

    async fn on_private_message(
        &self,
        server: &str,
        source: &str,
        from: &str,
        text: &str,
        ctx: &SessionContext,
    ) {
        let reply = match text.trim() {
            "help" => Some("Commands: help, who".to_string()),
            "who" => {
                let identity = self.identity.read();
                Some(format!(
                    "I am: {}#{} with ID {}",
                    identity.nick_source(),
                    identity.discriminator,
                    identity.id
                ))
            }
            _ => None,
        };
        if let Some(reply) = reply
            && let Err(e) = self.irc.privmsg(from, &reply).await
        {
            debug!(to = %from, error = %e, "Failed to answer PM");
        }

        let Some(channel_id) = self.pm_channel() else {
            debug!(%from, "No DM channel bound, PM not forwarded");
            return;
        };
        let post = DiscordOutbound {
            channel_id,
            text: format!("{server},{source}: {text}"),
        };
        if let Err(e) = ctx.router.post(post).await {
            debug!(error = %e, "Dropping PM forward");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("nick", &self.nick())
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
