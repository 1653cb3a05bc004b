//! Logging setup and span constructors.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "debug";

/// Runtime handle to the log filter.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    /// Switch between `info` and `debug`.
    ///
    /// An explicit `RUST_LOG` always wins.
    pub fn set_debug(&self, debug: bool) {
        if self.from_env {
            return;
        }
        let directive = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
        if let Err(e) = self.filter.reload(EnvFilter::new(directive)) {
            tracing::warn!(error = %e, "Failed to change log filter");
        }
    }
}

/// Install the global subscriber.
pub fn init(debug: bool) -> anyhow::Result<LogHandle> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::new(if debug { DEBUG_FILTER } else { DEFAULT_FILTER }),
            false,
        ),
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(LogHandle {
        filter: handle,
        from_env,
    })
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for one IRC session.
    pub fn session(id: &str, nick: &str) -> Span {
        info_span!("session", id = %id, nick = %nick)
    }

    /// Span for the Discord gateway connection.
    pub fn gateway(guild: &str) -> Span {
        info_span!("gateway", guild = %guild)
    }

    /// Span for one IRC transport connection attempt loop.
    pub fn transport(server: &str, nick: &str) -> Span {
        info_span!("irc", server = %server, nick = %nick)
    }
}
