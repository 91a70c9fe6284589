//! Remote brokers that exchange events with this one.

use std::collections::BTreeSet;

use crate::channel::{ChannelId, GLOBAL_CHANNEL};

/// Which side of the relationship a peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// A broker that asked to receive our events; we push to it.
    Server,
    /// An ephemeral peer that is also mirrored as a channel subscriber.
    Client,
}

impl PeerKind {
    /// Client peers are short-lived and addressed like subscribers.
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, PeerKind::Client)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PeerKind::Server => "server",
            PeerKind::Client => "client",
        }
    }
}

/// A peer and the channels it registered interest in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    address: String,
    kind: PeerKind,
    channels: BTreeSet<ChannelId>,
}

impl Peer {
    #[must_use]
    pub fn new(address: impl Into<String>, kind: PeerKind) -> Self {
        Self {
            address: address.into(),
            kind,
            channels: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Channels this peer is interested in, sorted.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Record interest in `channel`. Returns `false` if it was already recorded.
    pub fn add_channel(&mut self, channel: impl Into<ChannelId>) -> bool {
        self.channels.insert(channel.into())
    }

    /// Drop interest in `channel`. Returns `true` if it was recorded.
    pub fn remove_channel(&mut self, channel: &str) -> bool {
        self.channels.remove(channel)
    }

    /// Whether an event published to `channel` should reach this peer.
    #[must_use]
    pub fn is_interested_in(&self, channel: &str) -> bool {
        self.channels.contains(channel) || self.channels.contains(GLOBAL_CHANNEL)
    }
}
