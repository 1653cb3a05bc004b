//! Channel name helpers.

/// Extension trait for recognising channel targets.
pub trait ChannelExt {
    /// True if the string names a channel (`#`, `&`, `+` or `!` prefix).
    fn is_channel_name(&self) -> bool;
}

impl ChannelExt for str {
    fn is_channel_name(&self) -> bool {
        let mut chars = self.chars();
        match chars.next() {
            Some('#' | '&' | '+' | '!') => {
                self.len() > 1 && !self.contains(|c| matches!(c, ' ' | ',' | '\x07'))
            }
            _ => false,
        }
    }
}

impl ChannelExt for String {
    fn is_channel_name(&self) -> bool {
        self.as_str().is_channel_name()
    }
}
