//! TCP/TLS implementation of [`IrcConnector`].
//!
//! One task per connection: connect, register, relay commands and events,
//! and reconnect with capped exponential backoff until a `Quit` arrives or
//! the session drops its handle.

use super::{COMMAND_QUEUE, ConnectParams, IrcCommand, IrcConnector, IrcError, IrcEvent, IrcHandle};
use dib_proto::{ChannelExt, IrcCodec, Message, action_text, irc_eq};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, warn};

const EVENT_QUEUE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(90);
const PING_TIMEOUT: Duration = Duration::from_secs(240);
const BACKOFF: [u64; 5] = [2, 4, 8, 16, 30];

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type Connection = Framed<Box<dyn Stream>, IrcCodec>;

/// How a connected run ended.
enum Exit {
    /// We quit; stop for good.
    Quit,
    /// The link dropped; reconnect.
    Lost(String),
}

/// Opens real IRC connections.
#[derive(Clone)]
pub struct TcpConnector {
    tls: Arc<rustls::ClientConfig>,
    insecure_tls: Arc<rustls::ClientConfig>,
}

impl TcpConnector {
    pub fn new() -> Result<Self, IrcError> {
        Ok(Self {
            tls: Arc::new(verified_config()?),
            insecure_tls: Arc::new(insecure_config()?),
        })
    }
}

impl IrcConnector for TcpConnector {
    fn connect(&self, params: ConnectParams) -> (IrcHandle, mpsc::Receiver<IrcEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let tls = if params.insecure {
            Arc::clone(&self.insecure_tls)
        } else {
            Arc::clone(&self.tls)
        };
        let span = crate::telemetry::spans::transport(&params.server, &params.nick);
        tokio::spawn(run(params, tls, cmd_rx, event_tx).instrument(span));
        (IrcHandle::new(cmd_tx), event_rx)
    }
}

fn backoff(attempt: usize) -> Duration {
    let base = BACKOFF[attempt.min(BACKOFF.len() - 1)] * 1000;
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

async fn run(
    mut params: ConnectParams,
    tls: Arc<rustls::ClientConfig>,
    mut commands: mpsc::Receiver<IrcCommand>,
    events: mpsc::Sender<IrcEvent>,
) {
    let mut attempt = 0usize;
    loop {
        let reason = match open(&params, &tls).await {
            Ok(conn) => match drive(conn, &mut params, &mut commands, &events, &mut attempt).await {
                Ok(Exit::Quit) => return,
                Ok(Exit::Lost(reason)) => reason,
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        if events.is_closed() {
            return;
        }
        warn!(%reason, "IRC connection lost");
        let _ = events.send(IrcEvent::Disconnected { reason }).await;

        let delay = backoff(attempt);
        attempt += 1;
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    None | Some(IrcCommand::Quit(_)) => return,
                    Some(cmd) => debug!(?cmd, "Not connected, dropping command"),
                },
            }
        }
    }
}

async fn open(params: &ConnectParams, tls: &Arc<rustls::ClientConfig>) -> Result<Connection, IrcError> {
    let host = params
        .server
        .rsplit_once(':')
        .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| IrcError::InvalidServer(params.server.clone()))?;

    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&params.server))
        .await
        .map_err(|_| IrcError::Timeout)??;
    tcp.set_nodelay(true)?;

    let stream: Box<dyn Stream> = if params.tls {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| IrcError::InvalidServer(params.server.clone()))?;
        let tls_stream = TlsConnector::from(Arc::clone(tls))
            .connect(name, tcp)
            .await
            .map_err(|e| IrcError::Tls(e.to_string()))?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };
    debug!(tls = params.tls, "Connected");
    Ok(Framed::new(stream, IrcCodec::default()))
}

fn command_message(cmd: IrcCommand) -> Option<Message> {
    match cmd {
        IrcCommand::Privmsg { target, text } => Some(Message::privmsg(&target, &text)),
        IrcCommand::Nick(nick) => Some(Message::nick(&nick)),
        IrcCommand::Quit(reason) => Some(Message::quit(reason.as_deref())),
        other => match other.to_line().parse() {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(error = %e, "Dropping malformed outgoing line");
                None
            }
        },
    }
}

/// Nickname to try after a 433.
fn fallback_nick(nick: &str, max_len: usize) -> String {
    if nick.len() < max_len {
        format!("{nick}_")
    } else {
        let mut trimmed: String = nick.chars().take(max_len.saturating_sub(1)).collect();
        trimmed.push('_');
        trimmed
    }
}

async fn drive(
    mut conn: Connection,
    params: &mut ConnectParams,
    commands: &mut mpsc::Receiver<IrcCommand>,
    events: &mpsc::Sender<IrcEvent>,
    attempt: &mut usize,
) -> Result<Exit, IrcError> {
    if let Some(webirc) = &params.webirc {
        conn.send(Message::new(
            "WEBIRC",
            [&webirc.password, &webirc.gateway, &webirc.hostname, &webirc.ip],
        ))
        .await?;
    }
    conn.send(Message::nick(&params.nick)).await?;
    conn.send(Message::user(&params.username, &params.realname)).await?;

    let mut registered = false;
    let mut pending: Vec<IrcCommand> = Vec::new();
    let mut last_activity = Instant::now();
    let mut next_ping = last_activity + PING_INTERVAL;

    loop {
        tokio::select! {
            frame = conn.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(Exit::Lost("Connection closed".to_string())),
                };
                last_activity = Instant::now();
                next_ping = last_activity + PING_INTERVAL;

                if msg.command == "PING" {
                    conn.send(Message::pong(msg.param(0).unwrap_or_default())).await?;
                } else if msg.command == "ERROR" {
                    return Ok(Exit::Lost(msg.param(0).unwrap_or("ERROR").to_string()));
                } else if msg.is_numeric(1) {
                    registered = true;
                    *attempt = 0;
                    if let Some(nick) = msg.param(0) {
                        params.nick = nick.to_string();
                    }
                    info!(nick = %params.nick, "Registered");
                    if events.send(IrcEvent::Ready { nick: params.nick.clone() }).await.is_err() {
                        return Ok(quit(&mut conn, None).await);
                    }
                    for cmd in pending.drain(..) {
                        if let Some(msg) = command_message(cmd) {
                            conn.send(msg).await?;
                        }
                    }
                } else if msg.is_numeric(433) {
                    if registered {
                        let rejected = msg.param(1).unwrap_or_default().to_string();
                        warn!(nick = %rejected, current = %params.nick, "Nickname in use, keeping current nick");
                        let _ = events.send(IrcEvent::NickRejected { nick: rejected }).await;
                    } else {
                        params.nick = fallback_nick(&params.nick, params.nick_max_len);
                        debug!(nick = %params.nick, "Nickname in use, retrying");
                        conn.send(Message::nick(&params.nick)).await?;
                    }
                } else if msg.command == "NICK" {
                    let ours = msg.source_nick().is_some_and(|n| irc_eq(n, &params.nick));
                    if let (true, Some(new)) = (ours, msg.param(0)) {
                        params.nick = new.to_string();
                        let _ = events.send(IrcEvent::NickChanged { nick: new.to_string() }).await;
                    }
                } else if msg.command == "PRIVMSG"
                    && let Some(event) = privmsg_event(&msg, &params.server)
                {
                    let _ = events.send(event).await;
                }
            }
            cmd = commands.recv() => match cmd {
                None => return Ok(quit(&mut conn, None).await),
                Some(IrcCommand::Quit(reason)) => return Ok(quit(&mut conn, reason.as_deref()).await),
                Some(cmd) if !registered => pending.push(cmd),
                Some(cmd) => {
                    if let Some(msg) = command_message(cmd) {
                        conn.send(msg).await?;
                    }
                }
            },
            _ = tokio::time::sleep_until(next_ping) => {
                if last_activity.elapsed() > PING_TIMEOUT {
                    return Ok(Exit::Lost("Ping timeout".to_string()));
                }
                next_ping = Instant::now() + PING_INTERVAL;
                conn.send(Message::new("PING", ["keepalive"])).await?;
            }
        }
    }
}

async fn quit(conn: &mut Connection, reason: Option<&str>) -> Exit {
    if let Err(e) = conn.send(Message::quit(reason)).await {
        debug!(error = %e, "Failed to send QUIT");
    }
    let _ = conn.close().await;
    Exit::Quit
}

fn privmsg_event(msg: &Message, server: &str) -> Option<IrcEvent> {
    let target = msg.param(0)?;
    let text = msg.param(1)?;
    let from = msg.source_nick()?.to_string();

    if target.is_channel_name() {
        let (text, is_action) = match action_text(text) {
            Some(body) => (body, true),
            None => (text, false),
        };
        Some(IrcEvent::ChannelMessage {
            channel: target.to_string(),
            from,
            text: text.to_string(),
            is_action,
        })
    } else {
        Some(IrcEvent::PrivateMessage {
            server: server.to_string(),
            source: msg
                .prefix
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| from.clone()),
            from,
            text: text.to_string(),
        })
    }
}

// =============================================================================
// TLS
// =============================================================================

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn verified_config() -> Result<rustls::ClientConfig, IrcError> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(error = %e, "Error loading a native root certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded native root certificates");

    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| IrcError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn insecure_config() -> Result<rustls::ClientConfig, IrcError> {
    let provider = provider();
    let verifier = Arc::new(InsecureVerifier(Arc::clone(&provider)));
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| IrcError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

/// Accepts any certificate. Only used with `irc.insecure`.
#[derive(Debug)]
struct InsecureVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
