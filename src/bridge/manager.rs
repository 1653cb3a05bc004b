//! Connection manager: owns every IRC session.
//!
//! The identity-id -> session table and the nickname reservations are the
//! only state touched from several call paths (router dispatch, rename
//! reconciliation, idle reaping). Both are `DashMap`s and every mutation
//! goes through the entry API, so check-and-insert is atomic per key.
//!
//! Renames tear a session down and recreate it after a settle delay. Each
//! scheduled recreate carries a generation number; a recreate whose
//! generation is no longer current is discarded.

use super::BridgeSettings;
use super::envelope::IrcOutbound;
use super::router::RouterHandle;
use super::session::{DetailsChange, OFFLINE_AWAY, Session, SessionContext, SessionRole};
use crate::discord::{DiscordApi, Identity};
use crate::irc::{ConnectParams, IrcConnector, WebIrc};
use crate::mapping::{ChannelMapping, MappingTable};
use crate::util;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dib_proto::{irc_eq, irc_to_lower, sanitize_nick};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Nickname owner key for the listener connection.
pub const LISTENER_ID: &str = "~listener";

const FALLBACK_NICK: &str = "user";
const SHUTDOWN_REASON: &str = "Bridge shutting down";
const IDLE_REASON: &str = "Inactive";

/// A recreate waiting out the settle delay.
#[derive(Debug, Clone)]
struct PendingRecreate {
    generation: u64,
    /// Latest identity seen while waiting.
    identity: Identity,
}

pub struct ConnectionManager {
    sessions: DashMap<String, Arc<Session>>,
    /// Folded nickname -> owning identity id.
    nicks: DashMap<String, String>,
    recreates: DashMap<String, PendingRecreate>,
    generation: AtomicU64,
    listener: RwLock<Option<Arc<Session>>>,
    closing: AtomicBool,

    settings: BridgeSettings,
    mapping: Arc<ChannelMapping>,
    discord: Arc<dyn DiscordApi>,
    irc: Arc<dyn IrcConnector>,
    router: RouterHandle,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        settings: BridgeSettings,
        mapping: Arc<ChannelMapping>,
        discord: Arc<dyn DiscordApi>,
        irc: Arc<dyn IrcConnector>,
        router: RouterHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: DashMap::new(),
            nicks: DashMap::new(),
            recreates: DashMap::new(),
            generation: AtomicU64::new(0),
            listener: RwLock::new(None),
            closing: AtomicBool::new(false),
            settings,
            mapping,
            discord,
            irc,
            router,
            this: this.clone(),
        })
    }

    pub fn discord(&self) -> &Arc<dyn DiscordApi> {
        &self.discord
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn listener(&self) -> Option<Arc<Session>> {
        self.listener.read().clone()
    }

    pub fn last_pulse(&self, id: &str) -> Option<Instant> {
        self.sessions.get(id).map(|s| s.last_pulse())
    }

    /// Whether `nick` belongs to a session we run (the listener included).
    pub fn is_managed_nick(&self, nick: &str) -> bool {
        self.nicks.contains_key(&irc_to_lower(nick))
    }

    // =========================================================================
    // Nicknames
    // =========================================================================

    /// Reserve a nickname for `identity`.
    ///
    /// `sanitized[..fit] + suffix + n`, with `n` omitted on the first try and
    /// counting up on collision. A nickname already held by the same
    /// identity counts as free.
    pub fn generate_nickname(&self, identity: &Identity) -> String {
        let mut base = sanitize_nick(identity.nick_source());
        if base.is_empty() {
            base = FALLBACK_NICK.to_string();
        }
        self.reserve_counted(&base, &self.settings.suffix, &identity.id)
    }

    /// Reserve the first free `base[..fit] + suffix + n` for `owner`.
    fn reserve_counted(&self, base: &str, suffix: &str, owner: &str) -> String {
        let max_len = self.settings.nick_max_len;
        let mut attempt = 0u64;
        loop {
            let counter = if attempt == 0 {
                String::new()
            } else {
                attempt.to_string()
            };
            let room = max_len.saturating_sub(suffix.len() + counter.len());
            let trimmed: String = base.chars().take(room).collect();
            let candidate = format!("{trimmed}{suffix}{counter}");
            if self.reserve_nick(&candidate, owner) {
                return candidate;
            }
            attempt += 1;
        }
    }

    fn reserve_nick(&self, nick: &str, owner: &str) -> bool {
        match self.nicks.entry(irc_to_lower(nick)) {
            Entry::Occupied(e) => e.get() == owner,
            Entry::Vacant(e) => {
                e.insert(owner.to_string());
                true
            }
        }
    }

    /// Free `nick` if `owner` still holds it.
    pub fn release_nick(&self, nick: &str, owner: &str) {
        self.nicks.remove_if(&irc_to_lower(nick), |_, held| held == owner);
    }

    fn owner_of(session: &Session) -> String {
        match session.role() {
            SessionRole::Listener => LISTENER_ID.to_string(),
            SessionRole::Puppet => session.id(),
        }
    }

    /// Send NICK for `session`. `nick` must already be reserved for it.
    ///
    /// The stored nick and its reservation stay in place until the server
    /// confirms with a NICK of its own.
    pub(crate) fn request_nick(&self, session: &Arc<Session>, nick: String) {
        let owner = Self::owner_of(session);
        let current = session.nick();
        let pending = (!irc_eq(&nick, &current)).then(|| nick.clone());
        if let Some(previous) = session.replace_pending_nick(pending)
            && !irc_eq(&previous, &nick)
            && !irc_eq(&previous, &current)
        {
            self.release_nick(&previous, &owner);
        }

        let session = Arc::clone(session);
        tokio::spawn(async move {
            if let Err(e) = session.irc().nick(&nick).await {
                warn!(%nick, error = %e, "Failed to send NICK");
            }
        });
    }

    /// The server now calls `session` by `nick`.
    pub(crate) fn track_nick_change(&self, session: &Session, nick: &str) {
        let confirmed = session.settle_pending_nick(nick);
        let old = session.nick();
        if irc_eq(&old, nick) {
            session.set_nick(nick);
            return;
        }
        let owner = Self::owner_of(session);
        if confirmed {
            debug!(%old, new = %nick, "Nickname change confirmed");
        } else {
            debug!(%old, new = %nick, "Server assigned a different nickname");
        }
        self.nicks.insert(irc_to_lower(nick), owner.clone());
        self.release_nick(&old, &owner);
        session.set_nick(nick);
    }

    /// The server refused to rename `session` to `nick`.
    pub(crate) fn nick_rejected(&self, session: &Session, nick: &str) {
        session.settle_pending_nick(nick);
        if !irc_eq(&session.nick(), nick) {
            info!(current = %session.nick(), rejected = %nick, "Nickname change refused");
            self.release_nick(nick, &Self::owner_of(session));
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    fn connect_params(&self, nick: &str, identity: &Identity) -> ConnectParams {
        ConnectParams {
            server: self.settings.server.clone(),
            tls: self.settings.tls,
            insecure: self.settings.insecure,
            nick: nick.to_string(),
            username: "discord".to_string(),
            realname: identity.display_name().to_string(),
            webirc: self
                .settings
                .webirc_password
                .as_deref()
                .map(|pass| WebIrc::for_discord_user(pass, &identity.id)),
            nick_max_len: self.settings.nick_max_len,
        }
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            manager: self.this.clone(),
            mapping: Arc::clone(&self.mapping),
            router: self.router.clone(),
        }
    }

    /// Session for `identity`, creating and starting one if none is live.
    ///
    /// Returns `None` only once shutdown has begun.
    pub fn create_connection(&self, identity: Identity) -> Option<Arc<Session>> {
        if self.closing.load(Ordering::SeqCst) {
            debug!(id = %identity.id, "Shutting down, not creating session");
            return None;
        }

        match self.sessions.entry(identity.id.clone()) {
            Entry::Occupied(e) => Some(Arc::clone(e.get())),
            // Checked again under the shard lock so a concurrent
            // disconnect_all either sees this session or we see the flag.
            Entry::Vacant(_) if self.closing.load(Ordering::SeqCst) => {
                debug!(id = %identity.id, "Shutting down, not creating session");
                None
            }
            Entry::Vacant(e) => {
                let nick = self.generate_nickname(&identity);
                let params = self.connect_params(&nick, &identity);
                let (irc, events) = self.irc.connect(params);
                info!(id = %identity.id, %nick, "Creating IRC session");
                let session = Session::spawn(
                    SessionRole::Puppet,
                    identity,
                    nick,
                    self.settings.server.clone(),
                    self.settings.session_queue,
                    irc,
                    events,
                    self.context(),
                );
                e.insert(Arc::clone(&session));
                Some(session)
            }
        }
    }

    /// Reconcile a Discord identity, creating its session if needed.
    pub fn handle_user(&self, identity: Identity) {
        self.reconcile(identity, true);
    }

    /// Reconcile a Discord identity without creating a session.
    pub fn refresh_user(&self, identity: Identity) {
        self.reconcile(identity, false);
    }

    fn reconcile(&self, identity: Identity, create: bool) {
        if identity.bot {
            return;
        }

        if let Some(session) = self.session(&identity.id) {
            let was_online = session.identity().online;
            let online = identity.online;
            let change = session.update_details(identity, self);
            if change != DetailsChange::Recreating && was_online != online {
                let status = if online { "" } else { OFFLINE_AWAY };
                tokio::spawn(async move { session.set_away(status).await });
            }
            return;
        }

        if let Some(mut pending) = self.recreates.get_mut(&identity.id) {
            debug!(id = %identity.id, "Recreate pending, updating identity");
            pending.identity = identity;
            return;
        }

        if create {
            self.create_connection(identity);
        }
    }

    /// Remove `session` from the table and free its nickname.
    ///
    /// Only the exact session passed in is removed; a newer session for the
    /// same identity is left alone.
    pub(crate) fn detach(&self, session: &Arc<Session>) -> bool {
        let id = session.id();
        let removed = self
            .sessions
            .remove_if(&id, |_, live| Arc::ptr_eq(live, session))
            .is_some();
        if removed {
            if let Some(pending) = session.replace_pending_nick(None) {
                self.release_nick(&pending, &id);
            }
            self.release_nick(&session.nick(), &id);
        }
        removed
    }

    /// Quit `session` with `reason` and drop it from the table.
    pub async fn close_connection(&self, session: &Arc<Session>, reason: &str) {
        self.detach(session);
        session.quit(reason).await;
    }

    /// Recreate `identity` after the settle delay.
    pub(crate) fn schedule_recreate(&self, identity: Identity) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let id = identity.id.clone();
        self.recreates.insert(
            id.clone(),
            PendingRecreate {
                generation,
                identity,
            },
        );

        let manager = self.this.clone();
        let delay = self.settings.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.refresh_pending(&id, generation).await;
                manager.recreate(&id, generation);
            }
        });
    }

    /// Pull the latest identity for a pending recreate from Discord.
    ///
    /// Keeps the last seen identity if the lookup fails. Presence is not
    /// part of a user lookup, so the pending online flag is kept.
    async fn refresh_pending(&self, id: &str, generation: u64) {
        let current = |p: &PendingRecreate| p.generation == generation;
        if !self.recreates.get(id).is_some_and(|p| current(p.value())) {
            return;
        }
        let fresh = match self.discord.user(id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                debug!(%id, error = %e, "Identity lookup failed, recreating with last seen");
                return;
            }
        };
        if let Some(mut pending) = self.recreates.get_mut(id)
            && current(pending.value())
        {
            let online = pending.identity.online;
            pending.identity = Identity { online, ..fresh };
        }
    }

    /// Fire a scheduled recreate if it is still the current one.
    pub fn recreate(&self, id: &str, generation: u64) {
        match self
            .recreates
            .remove_if(id, |_, pending| pending.generation == generation)
        {
            Some((_, pending)) => {
                self.create_connection(pending.identity);
            }
            None => debug!(%id, generation, "Recreate superseded"),
        }
    }

    // =========================================================================
    // Router-facing operations
    // =========================================================================

    /// IRC channels `id` should join, in table order.
    ///
    /// Falls back to every mapped channel when Discord cannot tell us what
    /// the user can see.
    pub async fn request_channels(&self, id: &str) -> Vec<String> {
        let table = self.mapping.snapshot();
        let candidates = table.discord_channels();
        let visible = match self.discord.visible_channels(id, &candidates).await {
            Ok(visible) => visible,
            Err(e) => {
                warn!(%id, error = %e, "Channel visibility lookup failed, joining all");
                candidates
            }
        };
        table
            .pairs()
            .iter()
            .filter(|p| visible.contains(&p.discord_channel))
            .map(|p| p.irc_channel.clone())
            .collect()
    }

    /// Mark `id` as active.
    pub fn pulse_id(&self, id: &str) {
        if let Some(session) = self.sessions.get(id) {
            session.pulse();
        }
    }

    /// Queue a line on `id`'s session. Never creates a session.
    pub fn send_message(&self, id: &str, msg: IrcOutbound) {
        match self.sessions.get(id).map(|s| Arc::clone(s.value())) {
            Some(session) => session.enqueue(msg),
            None => warn!(%id, channel = %msg.irc_channel, "No session for identity, dropping message"),
        }
    }

    // =========================================================================
    // Listener
    // =========================================================================

    /// Start the shared listener connection.
    pub fn open_listener(&self, name: &str) -> Option<Arc<Session>> {
        let mut slot = self.listener.write();
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(listener) = slot.as_ref() {
            return Some(Arc::clone(listener));
        }

        let nick = self.reserve_counted(name, "", LISTENER_ID);
        if nick != name {
            warn!(%name, %nick, "Listener name collides with a managed nickname");
        }
        let name = nick.as_str();
        let identity = Identity {
            id: LISTENER_ID.to_string(),
            username: name.to_string(),
            online: true,
            ..Default::default()
        };
        let params = ConnectParams {
            webirc: None,
            ..self.connect_params(name, &identity)
        };
        let (irc, events) = self.irc.connect(params);
        info!(nick = %name, "Opening IRC listener");
        let listener = Session::spawn(
            SessionRole::Listener,
            identity,
            name.to_string(),
            self.settings.server.clone(),
            self.settings.session_queue,
            irc,
            events,
            self.context(),
        );
        *slot = Some(Arc::clone(&listener));
        Some(listener)
    }

    /// Change the listener's live nickname.
    pub fn rename_listener(&self, name: &str) {
        let Some(listener) = self.listener() else {
            return;
        };
        if listener.nick() == name || listener.pending_nick().as_deref() == Some(name) {
            return;
        }
        if !self.reserve_nick(name, LISTENER_ID) {
            warn!(%name, current = %listener.nick(), "Listener name collides with a managed nickname, keeping current");
            return;
        }
        self.request_nick(&listener, name.to_string());
    }

    /// Quit the listener, if any.
    pub async fn disconnect_listener(&self) {
        let listener = self.listener.write().take();
        if let Some(listener) = listener {
            if let Some(pending) = listener.replace_pending_nick(None) {
                self.release_nick(&pending, LISTENER_ID);
            }
            self.release_nick(&listener.nick(), LISTENER_ID);
            listener.quit(SHUTDOWN_REASON).await;
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Close every session and the listener. Best-effort; never fails.
    pub async fn disconnect_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.recreates.clear();

        let sessions = util::values(&self.sessions);
        info!(count = sessions.len(), "Disconnecting all IRC sessions");
        join_all(
            sessions
                .iter()
                .map(|session| self.close_connection(session, SHUTDOWN_REASON)),
        )
        .await;

        self.disconnect_listener().await;
    }

    /// Close sessions idle for longer than the cooldown, until shutdown.
    pub fn spawn_cooldown_reaper(&self, mut shutdown: broadcast::Receiver<()>) {
        let Some(cooldown) = self.settings.cooldown else {
            return;
        };
        let manager = self.this.clone();
        let period = (cooldown / 4).clamp(Duration::from_millis(10), Duration::from_secs(60));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.reap_idle(cooldown).await;
                    }
                }
            }
        });
    }

    async fn reap_idle(&self, cooldown: Duration) {
        let idle: Vec<Arc<Session>> = util::values(&self.sessions)
            .into_iter()
            .filter(|s| s.last_pulse().elapsed() >= cooldown)
            .collect();
        for session in idle {
            info!(id = %session.id(), nick = %session.nick(), "Closing idle session");
            self.close_connection(&session, IDLE_REASON).await;
        }
    }

    // =========================================================================
    // Mapping reload
    // =========================================================================

    /// Bring live sessions in line with a replaced mapping table.
    pub fn apply_mapping_change(&self, old: &MappingTable, new: &MappingTable) {
        let diff = old.diff(new);
        if diff.is_empty() {
            return;
        }
        info!(added = ?diff.added, removed = ?diff.removed, "Channel mappings changed");

        let part = (!diff.removed.is_empty()).then(|| format!("PART {}", diff.removed.join(",")));
        let listener_join = new.join_command(&diff.added);

        if let Some(listener) = self.listener() {
            let part = part.clone();
            let join = listener_join.clone();
            tokio::spawn(async move {
                for line in part.into_iter().chain(join) {
                    if let Err(e) = listener.irc().raw(line).await {
                        warn!(error = %e, "Listener failed to apply mapping change");
                    }
                }
            });
        }

        let added = diff.added;
        for session in util::values(&self.sessions) {
            let part = part.clone();
            let added = added.clone();
            let manager = self.this.clone();
            tokio::spawn(async move {
                if let Some(line) = part
                    && let Err(e) = session.irc().raw(line).await
                {
                    debug!(error = %e, "Failed to part removed channels");
                }
                if added.is_empty() {
                    return;
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let channels: Vec<String> = manager
                    .request_channels(&session.id())
                    .await
                    .into_iter()
                    .filter(|c| added.contains(c))
                    .collect();
                let join = manager.mapping.snapshot().join_command(&channels);
                if let Some(join) = join
                    && let Err(e) = session.irc().raw(join).await
                {
                    debug!(error = %e, "Failed to join added channels");
                }
            });
        }
    }
}
