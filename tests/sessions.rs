//! Session creation, nickname allocation and per-session delivery.

mod common;

use common::{FakeIrc, TestBridge, identity, settings, wait_until};
use dib_proto::irc_to_lower;
use dibd::bridge::{DiscordInbound, SessionState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn hello(author: &str, text: &str) -> DiscordInbound {
    DiscordInbound {
        author_id: author.to_string(),
        channel_id: "#general".to_string(),
        text: text.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_share_one_session() {
    let t = TestBridge::start(settings(), &[("#general", "#main")], FakeIrc::stalled());
    let bob = identity("1", "Bob");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(t.manager());
            let bob = bob.clone();
            tokio::spawn(async move { manager.create_connection(bob) })
        })
        .collect();

    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap().expect("not shutting down"));
    }

    assert_eq!(t.manager().session_count(), 1);
    assert_eq!(t.irc.connection_count(), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn colliding_names_get_distinct_nicks() {
    let t = TestBridge::start(settings(), &[("#general", "#main")], FakeIrc::stalled());
    let names = ["Bob", "bob", "BOB", "B o b", "bob!", "Bob", "[bob]", "{bob}"];

    let handles: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let manager = Arc::clone(t.manager());
            let who = identity(&i.to_string(), name);
            tokio::spawn(async move { manager.create_connection(who) })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let nicks: Vec<String> = (0..names.len())
        .map(|i| t.manager().session(&i.to_string()).unwrap().nick())
        .collect();
    let folded: HashSet<String> = nicks.iter().map(|n| irc_to_lower(n)).collect();
    assert_eq!(folded.len(), names.len(), "duplicate nick in {nicks:?}");
    assert!(nicks.iter().all(|n| n.contains("~d")));
    assert!(nicks.iter().all(|n| n.len() <= 30));
}

#[tokio::test]
async fn long_names_are_truncated_before_the_suffix() {
    let mut s = settings();
    s.nick_max_len = 9;
    let t = TestBridge::start(s, &[("#general", "#main")], FakeIrc::stalled());

    let first = t
        .manager()
        .create_connection(identity("1", "abcdefghijkl"))
        .unwrap();
    let second = t
        .manager()
        .create_connection(identity("2", "abcdefghijkl"))
        .unwrap();

    assert_eq!(first.nick(), "abcdefg~d");
    assert_eq!(second.nick(), "abcdef~d1");
}

#[tokio::test]
async fn bots_never_get_sessions() {
    let t = TestBridge::simple();
    let mut bot = identity("9", "Helper");
    bot.bot = true;

    t.bridge.router().user_update(bot).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(t.manager().session_count(), 0);
    assert_eq!(t.irc.connection_count(), 0);
}

#[tokio::test]
async fn session_registers_joins_and_sets_mode() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;

    assert_eq!(conn.params.nick, "Bob~d");
    assert_eq!(conn.params.realname, "Bob");
    assert_eq!(conn.params.username, "discord");
    assert!(conn.params.webirc.is_none());
    assert!(conn.has_line("JOIN #main"));
    assert!(conn.has_line("MODE Bob~d +D"));
    assert!(!conn.lines().iter().any(|l| l.starts_with("AWAY")));
}

#[tokio::test]
async fn webirc_identifies_the_discord_user() {
    let mut s = settings();
    s.webirc_password = Some("secret".to_string());
    let t = TestBridge::start(s, &[("#general", "#main")], FakeIrc::new());

    let conn = t.join(identity("42", "Bob")).await;
    let webirc = conn.params.webirc.clone().expect("webirc set");
    assert_eq!(webirc.password, "secret");
    assert_eq!(webirc.hostname, "42.user.discord");
}

#[tokio::test]
async fn joins_only_visible_channels() {
    let t = TestBridge::start(
        settings(),
        &[("#general", "#main"), ("#staff", "#ops")],
        FakeIrc::new(),
    );
    t.discord.set_visible("1", &["#general"]);

    let conn = t.join(identity("1", "Bob")).await;
    assert!(conn.has_line("JOIN #main"));
    assert!(!conn.lines().iter().any(|l| l.contains("#ops")));
}

#[tokio::test]
async fn offline_identity_is_marked_away_on_connect() {
    let t = TestBridge::simple();
    let mut bob = identity("1", "Bob");
    bob.online = false;

    let conn = t.join(bob).await;
    assert!(conn.has_line("AWAY :Offline on Discord"));
}

#[tokio::test]
async fn messages_are_delivered_in_order_once_ready() {
    let t = TestBridge::start(settings(), &[("#general", "#main")], FakeIrc::stalled());
    let router = t.bridge.router();
    router.user_update(identity("1", "Bob")).await.unwrap();

    for i in 0..50 {
        router.discord_message(hello("1", &format!("line {i}"))).await.unwrap();
    }
    let conn = t.connection_of("1").await;
    assert!(conn.privmsgs_to("#main").is_empty());
    assert_eq!(t.manager().session("1").unwrap().state(), SessionState::Connecting);

    conn.ready().await;
    wait_until("all lines delivered", || conn.privmsgs_to("#main").len() == 50).await;

    let expected: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
    assert_eq!(conn.privmsgs_to("#main"), expected);
}

#[tokio::test]
async fn stalled_session_does_not_hold_up_others() {
    let t = TestBridge::start(settings(), &[("#general", "#main")], FakeIrc::stalled());
    let router = t.bridge.router();
    router.user_update(identity("1", "Alice")).await.unwrap();
    router.user_update(identity("2", "Bob")).await.unwrap();

    let bob = t.connection_of("2").await;
    bob.ready().await;

    for i in 0..10 {
        router.discord_message(hello("1", &format!("a{i}"))).await.unwrap();
    }
    router.discord_message(hello("2", "from bob")).await.unwrap();

    wait_until("bob delivered", || bob.privmsgs_to("#main") == ["from bob"]).await;
    assert!(t.connection_of("1").await.privmsgs_to("#main").is_empty());
}

#[tokio::test]
async fn full_queue_drops_instead_of_blocking() {
    let mut s = settings();
    s.session_queue = 2;
    let t = TestBridge::start(s, &[("#general", "#main")], FakeIrc::stalled());
    let router = t.bridge.router();
    router.user_update(identity("1", "Bob")).await.unwrap();

    for i in 0..5 {
        router.discord_message(hello("1", &format!("m{i}"))).await.unwrap();
    }
    let conn = t.connection_of("1").await;
    conn.ready().await;

    wait_until("queued lines delivered", || conn.privmsgs_to("#main").len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.privmsgs_to("#main"), ["m0", "m1"]);
}

#[tokio::test]
async fn server_assigned_nick_is_tracked() {
    let t = TestBridge::start(settings(), &[("#general", "#main")], FakeIrc::stalled());
    let session = t.manager().create_connection(identity("1", "Bob")).unwrap();
    let conn = t.connection_of("1").await;

    conn.emit(dibd::irc::IrcEvent::Ready {
        nick: "Bob~d_".to_string(),
    })
    .await;

    wait_until("nick tracked", || session.nick() == "Bob~d_").await;
    assert!(t.manager().is_managed_nick("bob~d_"));
    assert!(!t.manager().is_managed_nick("Bob~d"));
}

#[tokio::test]
async fn disconnect_marks_session_reconnecting() {
    let t = TestBridge::simple();
    let conn = t.join(identity("1", "Bob")).await;

    conn.emit(dibd::irc::IrcEvent::Disconnected {
        reason: "Connection reset".to_string(),
    })
    .await;

    wait_until("reconnecting", || {
        t.manager().session("1").unwrap().state() == SessionState::Reconnecting
    })
    .await;
    conn.ready().await;
    wait_until("ready again", || {
        t.manager().session("1").unwrap().state() == SessionState::Ready
    })
    .await;
}
