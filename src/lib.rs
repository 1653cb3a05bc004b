//! dibd - Discord <-> IRC bridge.
//!
//! Every Discord user who speaks in a bridged channel gets their own IRC
//! connection and nickname; a single listener connection carries IRC
//! traffic back to Discord.

pub mod bridge;
pub mod config;
pub mod discord;
pub mod error;
pub mod irc;
pub mod mapping;
pub mod telemetry;
mod util;

pub use bridge::{Bridge, BridgeSettings};
pub use error::BridgeError;
