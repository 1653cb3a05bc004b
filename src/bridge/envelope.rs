//! Transient message envelopes passed between the two sides.

/// A chat message seen on Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordInbound {
    pub author_id: String,
    pub channel_id: String,
    pub text: String,
}

/// A post destined for a Discord channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordOutbound {
    pub channel_id: String,
    pub text: String,
}

/// A line queued on one session for an IRC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcOutbound {
    pub irc_channel: String,
    pub text: String,
    pub is_action: bool,
}

impl IrcOutbound {
    /// Turn one Discord message into IRC lines.
    ///
    /// Each non-empty line becomes its own entry. A line wrapped once in
    /// `_` or `*` is sent as an ACTION with the markers removed.
    pub fn from_discord(irc_channel: &str, text: &str) -> Vec<Self> {
        text.lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (text, is_action) = match action_body(line) {
                    Some(body) => (body, true),
                    None => (line, false),
                };
                Self {
                    irc_channel: irc_channel.to_string(),
                    text: text.to_string(),
                    is_action,
                }
            })
            .collect()
    }
}

fn action_body(line: &str) -> Option<&str> {
    ['_', '*'].into_iter().find_map(|marker| {
        let inner = line.strip_prefix(marker)?.strip_suffix(marker)?;
        let single = !inner.is_empty()
            && !inner.starts_with(marker)
            && !inner.ends_with(marker)
            && !inner.starts_with(' ');
        single.then_some(inner)
    })
}

/// A chat message seen by the listener in a bridged channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcInbound {
    pub irc_channel: String,
    pub author: String,
    pub text: String,
    pub is_action: bool,
}

impl IrcInbound {
    /// Discord rendering: `<nick> text`, or `_nick text_` for actions.
    pub fn to_discord_text(&self) -> String {
        if self.is_action {
            format!("_{} {}_", self.author, self.text)
        } else {
            format!("<{}> {}", self.author, self.text)
        }
    }
}
