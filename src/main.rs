//! dibd - Discord <-> IRC bridge daemon.

use anyhow::Context;
use clap::Parser;
use dibd::config::{Config, validate};
use dibd::discord::{DiscordClient, Gateway, RestClient};
use dibd::irc::TcpConnector;
use dibd::mapping::MappingTable;
use dibd::telemetry::{self, LogHandle};
use dibd::{Bridge, BridgeError, BridgeSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dibd")]
#[command(about = "Bridge a Discord guild and an IRC network")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DIBD_CONFIG")]
    config: PathBuf,

    /// Verbose relay logging (overrides bridge.debug)
    #[arg(long)]
    debug: bool,

    /// Skip IRC TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Connect to IRC without TLS
    #[arg(long)]
    no_irc_tls: bool,
}

impl Cli {
    /// Load, apply flag overrides, validate.
    fn load_config(&self) -> Result<Config, BridgeError> {
        let mut config = Config::load(&self.config)?;
        if self.debug {
            config.bridge.debug = true;
        }
        if self.insecure {
            config.irc.insecure = true;
        }
        if self.no_irc_tls {
            config.irc.tls = false;
        }
        validate(&config)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = telemetry::init(cli.debug)?;
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let config = cli.load_config().map_err(|e| {
        error!(path = %cli.config.display(), error = %e, code = e.error_code(), "Failed to load config");
        e
    })?;
    log.set_debug(config.bridge.debug);

    let table = MappingTable::from_config(&config.channel_mappings)?;
    info!(
        server = %config.irc.server,
        guild = %config.discord.guild_id,
        channels = table.len(),
        "Starting dibd"
    );

    let rest = RestClient::new(&config.discord.token, &config.discord.guild_id)?;
    let (gateway, gateway_handle) = Gateway::new(&config.discord.token, &config.discord.guild_id);
    let discord = Arc::new(DiscordClient::new(rest, gateway_handle));
    let irc = Arc::new(TcpConnector::new()?);

    let bridge = Bridge::new(BridgeSettings::from(&config), table, discord, irc);

    if let Err(e) = gateway.start(bridge.router()).await {
        error!(error = %e, "Could not connect to Discord");
        bridge.close().await;
        return Err(e).context("initial Discord gateway handshake failed");
    }
    bridge.open()?;

    wait_for_signals(&cli, &bridge, &log).await;

    info!("Shutting down");
    bridge.close().await;
    Ok(())
}

/// Re-read the config file and push the reloadable parts into the bridge.
fn reload(cli: &Cli, bridge: &Bridge, log: &LogHandle) {
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Reload rejected, keeping current configuration");
            return;
        }
    };

    bridge.set_debug_mode(config.bridge.debug);
    log.set_debug(config.bridge.debug);
    bridge.set_irc_listener_name(&config.irc.listener_name);

    match MappingTable::from_config(&config.channel_mappings) {
        Ok(table) => {
            if bridge.set_channel_mappings(table) {
                info!("Channel mappings reloaded");
            }
        }
        Err(e) => warn!(error = %e, "Invalid channel mappings, keeping current table"),
    }
    info!("Configuration reloaded");
}

#[cfg(unix)]
async fn wait_for_signals(cli: &Cli, bridge: &Bridge, log: &LogHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut hup, mut term) = match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
        (Ok(hup), Ok(term)) => (hup, term),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Signal handlers unavailable, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = term.recv() => return,
            _ = hup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(cli, bridge, log);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_cli: &Cli, _bridge: &Bridge, _log: &LogHandle) {
    let _ = tokio::signal::ctrl_c().await;
}
