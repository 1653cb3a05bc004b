//! Identity updates: no-ops, renicks and display-name recreates.

mod common;

use common::{TestBridge, identity, settings, wait_until};
use dibd::irc::IrcEvent;
use std::time::Duration;

#[tokio::test]
async fn identical_update_touches_nothing() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;
    let before = conn.lines();

    t.bridge.router().user_update(identity("1", "Bob")).await.unwrap();
    t.bridge.router().presence(identity("1", "Bob")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(conn.lines(), before);
    assert!(conn.quits().is_empty());
    assert!(conn.nick_changes().is_empty());
    assert_eq!(t.irc.connection_count(), 1);
}

#[tokio::test]
async fn guild_nick_change_renames_live_connection() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;

    let mut renamed = identity("1", "Bob");
    renamed.nick = "Robbie".to_string();
    t.bridge.router().user_update(renamed).await.unwrap();

    wait_until("NICK sent", || conn.nick_changes() == ["Robbie~d"]).await;
    assert!(conn.quits().is_empty());
    assert_eq!(t.irc.connection_count(), 1);
    // Nothing moves until the server agrees.
    let session = t.manager().session("1").unwrap();
    assert_eq!(session.nick(), "Bob~d");
    assert!(t.manager().is_managed_nick("Bob~d"));
    assert!(t.manager().is_managed_nick("Robbie~d"));

    conn.emit(IrcEvent::NickChanged {
        nick: "Robbie~d".to_string(),
    })
    .await;

    wait_until("old nick released", || !t.manager().is_managed_nick("Bob~d")).await;
    assert_eq!(session.nick(), "Robbie~d");
    assert_eq!(session.pending_nick(), None);
    assert!(t.manager().is_managed_nick("Robbie~d"));
}

#[tokio::test]
async fn refused_nick_change_keeps_current_nick() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;
    t.bridge.open().unwrap();
    let listener = t.irc.by_nick("~d").unwrap();

    let mut renamed = identity("1", "Bob");
    renamed.nick = "Robbie".to_string();
    t.bridge.router().user_update(renamed).await.unwrap();
    wait_until("NICK sent", || conn.nick_changes() == ["Robbie~d"]).await;

    conn.emit(IrcEvent::NickRejected {
        nick: "Robbie~d".to_string(),
    })
    .await;
    wait_until("refused nick released", || {
        !t.manager().is_managed_nick("Robbie~d")
    })
    .await;

    let session = t.manager().session("1").unwrap();
    assert_eq!(session.nick(), "Bob~d");
    assert_eq!(session.pending_nick(), None);
    assert!(t.manager().is_managed_nick("Bob~d"));

    // The puppet's own line must not come back to Discord.
    listener
        .emit(IrcEvent::ChannelMessage {
            channel: "#main".to_string(),
            from: "Bob~d".to_string(),
            text: "own line".to_string(),
            is_action: false,
        })
        .await;
    listener
        .emit(IrcEvent::ChannelMessage {
            channel: "#main".to_string(),
            from: "carol".to_string(),
            text: "real".to_string(),
            is_action: false,
        })
        .await;
    wait_until("real posted", || !t.discord.posts().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.discord.posts_to("#general"), ["<carol> real"]);
}

#[tokio::test]
async fn display_name_change_recreates_once() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;

    t.bridge.router().user_update(identity("1", "Bobby")).await.unwrap();

    wait_until("old connection quit", || !conn.quits().is_empty()).await;
    assert_eq!(
        conn.quits(),
        [Some("Changing real name from Bob to Bobby".to_string())]
    );

    wait_until("recreated", || t.irc.connection_count() == 2).await;
    let fresh = t.irc.by_realname("Bobby");
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].params.nick, "Bobby~d");
    assert_eq!(t.manager().session_count(), 1);
    assert_eq!(t.manager().session("1").unwrap().nick(), "Bobby~d");
}

#[tokio::test]
async fn recreate_uses_latest_known_identity() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;

    let mut latest = identity("1", "Bobby");
    latest.nick = "Bz".to_string();
    latest.online = false;
    t.discord.add_user(latest);
    t.bridge.router().user_update(identity("1", "Bobby")).await.unwrap();

    wait_until("old connection quit", || !conn.quits().is_empty()).await;
    wait_until("recreated", || t.irc.connection_count() == 2).await;
    let fresh = t.irc.by_realname("Bobby");
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].params.nick, "Bz~d");
    // Presence comes from the gateway, not the lookup.
    assert!(t.manager().session("1").unwrap().identity().online);
}

#[tokio::test]
async fn rapid_renames_settle_into_one_session() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;
    let router = t.bridge.router();

    router.user_update(identity("1", "Bobby")).await.unwrap();
    router.user_update(identity("1", "Rob")).await.unwrap();
    router.user_update(identity("1", "Robert")).await.unwrap();

    wait_until("recreated", || t.irc.connection_count() == 2).await;
    // Well past the settle delay: nothing else may appear.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(conn.quits().len(), 1);
    assert_eq!(t.irc.connection_count(), 2);
    assert_eq!(t.irc.by_realname("Robert").len(), 1);
    assert!(t.irc.by_realname("Bobby").is_empty());
    assert!(t.irc.by_realname("Rob").is_empty());
    assert_eq!(t.manager().session_count(), 1);
}

#[tokio::test]
async fn messages_during_recreate_are_not_misrouted() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;
    let router = t.bridge.router();

    router.user_update(identity("1", "Bobby")).await.unwrap();
    router
        .discord_message(dibd::bridge::DiscordInbound {
            author_id: "1".to_string(),
            channel_id: "#general".to_string(),
            text: "lost".to_string(),
        })
        .await
        .unwrap();

    wait_until("recreated", || t.irc.connection_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.privmsgs_to("#main").is_empty());
    assert_eq!(t.manager().session_count(), 1);
}

#[tokio::test]
async fn stale_recreate_is_discarded() {
    let mut s = settings();
    s.settle_delay = Duration::from_secs(30);
    let t = TestBridge::start(s, &[("#general", "#main")], common::FakeIrc::new());
    t.join(identity("1", "Bob")).await;

    t.bridge.router().user_update(identity("1", "Bobby")).await.unwrap();
    wait_until("detached", || t.manager().session_count() == 0).await;

    t.manager().recreate("1", 0);
    assert_eq!(t.manager().session_count(), 0);
    assert_eq!(t.irc.connection_count(), 1);
}

#[tokio::test]
async fn shutdown_cancels_pending_recreate() {
    let t = TestBridge::simple();
    t.join(identity("1", "Bob")).await;

    t.bridge.router().user_update(identity("1", "Bobby")).await.unwrap();
    wait_until("detached", || t.manager().session_count() == 0).await;
    t.bridge.close().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(t.irc.connection_count(), 1);
    assert_eq!(t.manager().session_count(), 0);
}

#[tokio::test]
async fn presence_change_toggles_away() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;
    let router = t.bridge.router();

    let mut offline = identity("1", "Bob");
    offline.online = false;
    router.presence(offline).await.unwrap();
    wait_until("away set", || conn.has_line("AWAY :Offline on Discord")).await;

    router.presence(identity("1", "Bob")).await.unwrap();
    wait_until("away cleared", || conn.has_line("AWAY")).await;
    assert!(conn.quits().is_empty());
}

#[tokio::test]
async fn presence_never_creates_sessions() {
    let t = TestBridge::simple();
    t.bridge.router().presence(identity("5", "Eve")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.manager().session_count(), 0);
    assert_eq!(t.irc.connection_count(), 0);
}
