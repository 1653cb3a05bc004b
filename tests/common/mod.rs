//! Integration test common infrastructure.
//!
//! Builds a bridge wired to in-memory collaborators so routing and session
//! lifecycle can be driven without any network.

pub mod discord;
pub mod irc;

#[allow(unused_imports)]
pub use discord::FakeDiscord;
#[allow(unused_imports)]
pub use irc::{FakeConnection, FakeIrc};

use dibd::bridge::ConnectionManager;
use dibd::discord::Identity;
use dibd::mapping::{ChannelPair, MappingTable};
use dibd::{Bridge, BridgeSettings};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(2);

/// Settings with short timers.
#[allow(dead_code)]
pub fn settings() -> BridgeSettings {
    BridgeSettings {
        server: "irc.test:6667".to_string(),
        settle_delay: Duration::from_millis(100),
        cooldown: None,
        post_timeout: Duration::from_millis(500),
        ..BridgeSettings::default()
    }
}

#[allow(dead_code)]
pub fn table(pairs: &[(&str, &str)]) -> MappingTable {
    MappingTable::from_pairs(
        pairs
            .iter()
            .map(|(discord, irc)| ChannelPair::parse(discord, irc).expect("valid pair")),
    )
    .expect("valid table")
}

#[allow(dead_code)]
pub fn identity(id: &str, username: &str) -> Identity {
    Identity {
        id: id.to_string(),
        username: username.to_string(),
        discriminator: "0001".to_string(),
        nick: String::new(),
        bot: false,
        online: true,
    }
}

/// Poll `check` until it holds, panicking after [`WAIT`].
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A bridge plus handles on its fakes.
pub struct TestBridge {
    pub bridge: Bridge,
    pub irc: Arc<FakeIrc>,
    pub discord: Arc<FakeDiscord>,
}

#[allow(dead_code)]
impl TestBridge {
    pub fn start(settings: BridgeSettings, pairs: &[(&str, &str)], irc: FakeIrc) -> Self {
        let irc = Arc::new(irc);
        let discord = Arc::new(FakeDiscord::default());
        let bridge = Bridge::new(settings, table(pairs), discord.clone(), irc.clone());
        Self {
            bridge,
            irc,
            discord,
        }
    }

    /// `#general` <-> `#main`, connections register immediately.
    pub fn simple() -> Self {
        Self::start(settings(), &[("#general", "#main")], FakeIrc::new())
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.bridge.manager()
    }

    /// Fake connection currently backing `id`'s session.
    pub async fn connection_of(&self, id: &str) -> Arc<FakeConnection> {
        wait_until("session exists", || self.manager().session(id).is_some()).await;
        let nick = self
            .manager()
            .session(id)
            .map(|s| s.nick())
            .expect("session exists");
        self.irc.by_nick(&nick).expect("connection for nick")
    }

    /// Create `identity`'s session through the router and wait for its JOIN.
    pub async fn join(&self, identity: Identity) -> Arc<FakeConnection> {
        let id = identity.id.clone();
        self.bridge
            .router()
            .user_update(identity)
            .await
            .expect("router running");
        let conn = self.connection_of(&id).await;
        wait_until("session joined", || {
            conn.lines().iter().any(|l| l.starts_with("JOIN"))
        })
        .await;
        wait_until("session ready", || {
            self.manager()
                .session(&id)
                .is_some_and(|s| s.state() == dibd::bridge::SessionState::Ready)
        })
        .await;
        conn
    }
}
