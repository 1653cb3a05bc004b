//! Recording IRC connector.

use dibd::irc::{COMMAND_QUEUE, ConnectParams, IrcCommand, IrcConnector, IrcEvent, IrcHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

/// One fake connection: what was asked of it, and a way to talk back.
pub struct FakeConnection {
    pub params: ConnectParams,
    commands: Mutex<Vec<(Instant, IrcCommand)>>,
    events: Mutex<Option<mpsc::Sender<IrcEvent>>>,
}

#[allow(dead_code)]
impl FakeConnection {
    pub fn commands(&self) -> Vec<IrcCommand> {
        self.commands.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_commands(&self) -> Vec<(Instant, IrcCommand)> {
        self.commands.lock().clone()
    }

    /// Commands as wire lines.
    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(IrcCommand::to_line).collect()
    }

    pub fn has_line(&self, line: &str) -> bool {
        self.lines().iter().any(|l| l == line)
    }

    pub fn quits(&self) -> Vec<Option<String>> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                IrcCommand::Quit(reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn nick_changes(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                IrcCommand::Nick(nick) => Some(nick),
                _ => None,
            })
            .collect()
    }

    /// Privmsg bodies sent to `target`, in order.
    pub fn privmsgs_to(&self, target: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                IrcCommand::Privmsg { target: t, text } if t == target => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.events.lock().is_none()
    }

    /// Deliver an event to the session as if the server sent it.
    pub async fn emit(&self, event: IrcEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn ready(&self) {
        self.emit(IrcEvent::Ready {
            nick: self.params.nick.clone(),
        })
        .await;
    }
}

/// Hands out [`FakeConnection`]s and records every one.
pub struct FakeIrc {
    auto_ready: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

#[allow(dead_code)]
impl FakeIrc {
    /// Connections register as soon as they are opened.
    pub fn new() -> Self {
        Self {
            auto_ready: AtomicBool::new(true),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Connections stay in `Connecting` until the test says otherwise.
    pub fn stalled() -> Self {
        let irc = Self::new();
        irc.auto_ready.store(false, Ordering::SeqCst);
        irc
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn by_nick(&self, nick: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.params.nick == nick)
            .cloned()
    }

    pub fn by_realname(&self, realname: &str) -> Vec<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.params.realname == realname)
            .cloned()
            .collect()
    }
}

impl IrcConnector for FakeIrc {
    fn connect(&self, params: ConnectParams) -> (IrcHandle, mpsc::Receiver<IrcEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(64);

        if self.auto_ready.load(Ordering::SeqCst) {
            let _ = event_tx.try_send(IrcEvent::Ready {
                nick: params.nick.clone(),
            });
        }

        let conn = Arc::new(FakeConnection {
            params,
            commands: Mutex::new(Vec::new()),
            events: Mutex::new(Some(event_tx)),
        });
        self.connections.lock().push(Arc::clone(&conn));

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let quit = matches!(cmd, IrcCommand::Quit(_));
                conn.commands.lock().push((Instant::now(), cmd));
                if quit {
                    conn.events.lock().take();
                    break;
                }
            }
        });

        (IrcHandle::new(cmd_tx), event_rx)
    }
}
