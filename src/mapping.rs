//! Discord channel <-> IRC channel mapping.
//!
//! The active table is an immutable [`MappingTable`] behind an
//! `RwLock<Arc<_>>`. Readers clone the `Arc` and drop the lock at once, so a
//! lookup sees either the old table or the new one, never a mix.

use dib_proto::{ChannelExt, irc_to_lower};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Errors building a mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("'{0}' is not an IRC channel name")]
    NotAChannel(String),
    #[error("discord channel {0} is mapped more than once")]
    DuplicateDiscord(String),
    #[error("IRC channel {0} is mapped more than once")]
    DuplicateIrc(String),
    #[error("discord channel id must not be empty")]
    EmptyDiscordId,
}

/// One bridged channel pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPair {
    pub discord_channel: String,
    pub irc_channel: String,
    /// Channel key (`+k`) used when joining.
    pub key: Option<String>,
}

impl ChannelPair {
    /// Parse the IRC side of a config entry: `"#chan"` or `"#chan key"`.
    pub fn parse(discord_channel: &str, irc_side: &str) -> Result<Self, MappingError> {
        if discord_channel.trim().is_empty() {
            return Err(MappingError::EmptyDiscordId);
        }
        let mut parts = irc_side.split_whitespace();
        let irc_channel = parts.next().unwrap_or_default();
        if !irc_channel.is_channel_name() {
            return Err(MappingError::NotAChannel(irc_side.to_string()));
        }
        Ok(Self {
            discord_channel: discord_channel.trim().to_string(),
            irc_channel: irc_channel.to_string(),
            key: parts.next().map(str::to_string),
        })
    }
}

/// Channels that appeared or disappeared between two tables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MappingDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MappingDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Immutable, validated one-to-one table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MappingTable {
    /// Sorted by IRC channel name.
    pairs: Vec<ChannelPair>,
    by_discord: HashMap<String, usize>,
    by_irc: HashMap<String, usize>,
}

impl MappingTable {
    /// Build a table, rejecting anything that is not one-to-one.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = ChannelPair>,
    {
        let mut pairs: Vec<ChannelPair> = pairs.into_iter().collect();
        pairs.sort_by_key(|p| irc_to_lower(&p.irc_channel));

        let mut by_discord = HashMap::with_capacity(pairs.len());
        let mut by_irc = HashMap::with_capacity(pairs.len());
        for (idx, pair) in pairs.iter().enumerate() {
            if by_discord.insert(pair.discord_channel.clone(), idx).is_some() {
                return Err(MappingError::DuplicateDiscord(pair.discord_channel.clone()));
            }
            if by_irc.insert(irc_to_lower(&pair.irc_channel), idx).is_some() {
                return Err(MappingError::DuplicateIrc(pair.irc_channel.clone()));
            }
        }

        Ok(Self {
            pairs,
            by_discord,
            by_irc,
        })
    }

    /// Build from the `[channel_mappings]` config table.
    pub fn from_config(entries: &BTreeMap<String, String>) -> Result<Self, MappingError> {
        let pairs = entries
            .iter()
            .map(|(discord, irc)| ChannelPair::parse(discord, irc))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_pairs(pairs)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[ChannelPair] {
        &self.pairs
    }

    pub fn to_irc(&self, discord_channel: &str) -> Option<&ChannelPair> {
        self.by_discord.get(discord_channel).map(|&i| &self.pairs[i])
    }

    pub fn to_discord(&self, irc_channel: &str) -> Option<&ChannelPair> {
        self.by_irc
            .get(&irc_to_lower(irc_channel))
            .map(|&i| &self.pairs[i])
    }

    /// IRC channel names, in table order.
    pub fn irc_channels(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.irc_channel.clone()).collect()
    }

    /// Discord channel ids, in table order.
    pub fn discord_channels(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.discord_channel.clone()).collect()
    }

    /// IRC channels present in `next` but not here, and the reverse.
    pub fn diff(&self, next: &MappingTable) -> MappingDiff {
        MappingDiff {
            added: next
                .pairs
                .iter()
                .filter(|p| self.to_discord(&p.irc_channel).is_none())
                .map(|p| p.irc_channel.clone())
                .collect(),
            removed: self
                .pairs
                .iter()
                .filter(|p| next.to_discord(&p.irc_channel).is_none())
                .map(|p| p.irc_channel.clone())
                .collect(),
        }
    }

    /// A single `JOIN` line for `channels`.
    ///
    /// Keyed channels go first so the key list lines up positionally.
    /// Channels not in the table are joined without a key.
    pub fn join_command(&self, channels: &[String]) -> Option<String> {
        if channels.is_empty() {
            return None;
        }
        let (mut keyed, plain): (Vec<_>, Vec<_>) = channels
            .iter()
            .map(|c| (c.as_str(), self.to_discord(c).and_then(|p| p.key.as_deref())))
            .partition(|(_, key)| key.is_some());
        let keys: Vec<&str> = keyed.iter().filter_map(|(_, k)| *k).collect();
        keyed.extend(plain);
        let names: Vec<&str> = keyed.into_iter().map(|(c, _)| c).collect();

        let mut line = format!("JOIN {}", names.join(","));
        if !keys.is_empty() {
            line.push(' ');
            line.push_str(&keys.join(","));
        }
        Some(line)
    }
}

/// The live, atomically replaceable mapping.
#[derive(Debug, Default)]
pub struct ChannelMapping {
    table: RwLock<Arc<MappingTable>>,
}

impl ChannelMapping {
    pub fn new(table: MappingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table; stays valid across a concurrent replace.
    pub fn snapshot(&self) -> Arc<MappingTable> {
        Arc::clone(&self.table.read())
    }

    pub fn to_irc(&self, discord_channel: &str) -> Option<String> {
        self.snapshot()
            .to_irc(discord_channel)
            .map(|p| p.irc_channel.clone())
    }

    pub fn to_discord(&self, irc_channel: &str) -> Option<String> {
        self.snapshot()
            .to_discord(irc_channel)
            .map(|p| p.discord_channel.clone())
    }

    /// Swap in a new table, returning the one it replaced.
    pub fn replace(&self, table: MappingTable) -> Arc<MappingTable> {
        std::mem::replace(&mut *self.table.write(), Arc::new(table))
    }
}
