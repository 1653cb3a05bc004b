//! Default value functions for configuration.

use dib_proto::DEFAULT_NICK_MAX_LEN;

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

// =============================================================================
// IRC Defaults
// =============================================================================

pub fn default_listener_name() -> String {
    "~d".to_string()
}

pub fn default_suffix() -> String {
    "~d".to_string()
}

pub fn default_nick_max_len() -> usize {
    DEFAULT_NICK_MAX_LEN
}

// =============================================================================
// Bridge Defaults
// =============================================================================

pub fn default_settle_delay_ms() -> u64 {
    1000
}

pub fn default_cooldown_secs() -> u64 {
    30 * 60
}

pub fn default_session_queue() -> usize {
    256
}

pub fn default_post_timeout_ms() -> u64 {
    5000
}
