//! Bridge core and its runtime control surface.
//!
//! - [`mapping`](crate::mapping): Discord <-> IRC channel table
//! - [`session`]: one IRC connection per Discord identity, plus the listener
//! - [`manager`]: owns the sessions, allocates nicknames
//! - [`router`]: single loop for every cross-system side effect

pub mod envelope;
pub mod manager;
pub mod router;
pub mod session;

pub use envelope::{DiscordInbound, DiscordOutbound, IrcInbound, IrcOutbound};
pub use manager::{ConnectionManager, LISTENER_ID};
pub use router::{MessageRouter, RouterEvent, RouterHandle};
pub use session::{DetailsChange, Session, SessionRole, SessionState};

use crate::config::Config;
use crate::discord::DiscordApi;
use crate::error::BridgeError;
use crate::irc::IrcConnector;
use crate::mapping::{ChannelMapping, MappingTable};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Runtime settings the core needs, flattened from [`Config`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub server: String,
    pub tls: bool,
    pub insecure: bool,
    pub webirc_password: Option<String>,
    pub listener_name: String,
    pub suffix: String,
    pub nick_max_len: usize,
    pub debug: bool,
    pub settle_delay: Duration,
    pub cooldown: Option<Duration>,
    pub session_queue: usize,
    pub post_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            server: "localhost:6667".to_string(),
            tls: false,
            insecure: false,
            webirc_password: None,
            listener_name: "~d".to_string(),
            suffix: "~d".to_string(),
            nick_max_len: dib_proto::DEFAULT_NICK_MAX_LEN,
            debug: false,
            settle_delay: Duration::from_secs(1),
            cooldown: None,
            session_queue: 256,
            post_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            server: config.irc.server.clone(),
            tls: config.irc.tls,
            insecure: config.irc.insecure,
            webirc_password: config.irc.webirc_password.clone(),
            listener_name: config.irc.listener_name.clone(),
            suffix: config.irc.suffix.clone(),
            nick_max_len: config.irc.nick_max_len,
            debug: config.bridge.debug,
            settle_delay: config.bridge.settle_delay(),
            cooldown: config.bridge.cooldown(),
            session_queue: config.bridge.session_queue,
            post_timeout: config.bridge.post_timeout(),
        }
    }
}

/// A running bridge instance.
///
/// Construction starts the router; [`Bridge::open`] brings up the listener
/// and idle reaping; [`Bridge::close`] runs the shutdown sequence and waits
/// for the router to finish.
pub struct Bridge {
    mapping: Arc<ChannelMapping>,
    manager: Arc<ConnectionManager>,
    router: RouterHandle,
    shutdown_tx: broadcast::Sender<()>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    listener_name: RwLock<String>,
    debug: Arc<AtomicBool>,
    opened: AtomicBool,
}

impl Bridge {
    /// Build the core and start the router. Must run inside a tokio runtime.
    pub fn new(
        settings: BridgeSettings,
        table: MappingTable,
        discord: Arc<dyn DiscordApi>,
        irc: Arc<dyn IrcConnector>,
    ) -> Self {
        let mapping = Arc::new(ChannelMapping::new(table));
        let (router, events) = RouterHandle::channel();
        let (shutdown_tx, _) = broadcast::channel(16);
        let debug = Arc::new(AtomicBool::new(settings.debug));
        let listener_name = settings.listener_name.clone();
        let post_timeout = settings.post_timeout;

        let manager = ConnectionManager::new(
            settings,
            Arc::clone(&mapping),
            Arc::clone(&discord),
            irc,
            router.clone(),
        );
        let message_router = MessageRouter::new(
            Arc::clone(&mapping),
            Arc::clone(&manager),
            discord,
            post_timeout,
            Arc::clone(&debug),
        );
        let router_task = tokio::spawn(message_router.run(events, shutdown_tx.subscribe()));

        Self {
            mapping,
            manager,
            router,
            shutdown_tx,
            router_task: Mutex::new(Some(router_task)),
            listener_name: RwLock::new(listener_name),
            debug,
            opened: AtomicBool::new(false),
        }
    }

    /// Submission handle for event producers.
    pub fn router(&self) -> RouterHandle {
        self.router.clone()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn mapping(&self) -> &Arc<ChannelMapping> {
        &self.mapping
    }

    /// Start the listener and the idle reaper.
    pub fn open(&self) -> Result<(), BridgeError> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyOpen);
        }
        if self.router.is_closed() {
            return Err(BridgeError::RouterClosed(crate::error::RouterClosed));
        }
        let name = self.listener_name.read().clone();
        self.manager.open_listener(&name);
        self.manager
            .spawn_cooldown_reaper(self.shutdown_tx.subscribe());
        info!(listener = %name, channels = self.mapping.snapshot().len(), "Bridge open");
        Ok(())
    }

    /// Run the shutdown sequence and wait for the router to exit.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.router_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Router task failed");
        }
    }

    pub fn set_irc_listener_name(&self, name: &str) {
        let changed = {
            let mut current = self.listener_name.write();
            if *current == name {
                false
            } else {
                *current = name.to_string();
                true
            }
        };
        if changed {
            info!(%name, "Renaming IRC listener");
            self.manager.rename_listener(name);
        }
    }

    pub fn set_debug_mode(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Swap in a new mapping table. Returns `false` if nothing changed.
    pub fn set_channel_mappings(&self, table: MappingTable) -> bool {
        if *self.mapping.snapshot() == table {
            return false;
        }
        let old = self.mapping.replace(table);
        let new = self.mapping.snapshot();
        self.manager.apply_mapping_change(&old, &new);
        true
    }
}
