//! Concurrent registry of channels, subscribers and peers.
//!
//! Every operation takes and releases its shard lock internally; callers only
//! ever see owned snapshots. Operations on missing entries are logged no-ops.

use crate::channel::{Channel, ChannelId, Subscriber, SubscriptionId, GLOBAL_CHANNEL};
use crate::peer::{Peer, PeerKind};
use dashmap::DashMap;
use tracing::{debug, info, trace};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Whether to drop channels once their last subscriber leaves.
    pub auto_delete_empty_channels: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_delete_empty_channels: true,
        }
    }
}

/// Channel → subscribers, plus server and client peers.
///
/// The `global` channel exists from construction and is never removed.
pub struct Registry {
    channels: DashMap<ChannelId, Channel>,
    server_peers: DashMap<String, Peer>,
    client_peers: DashMap<String, Peer>,
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating registry with config: {:?}", config);
        let channels = DashMap::new();
        channels.insert(GLOBAL_CHANNEL.to_string(), Channel::new(GLOBAL_CHANNEL));
        Self {
            channels,
            server_peers: DashMap::new(),
            client_peers: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            subscription_count: self.channels.iter().map(|c| c.subscriber_count()).sum(),
            server_peer_count: self.server_peers.len(),
            client_peer_count: self.client_peers.len(),
        }
    }

    /// Return a snapshot of `name`, creating the channel if absent.
    pub fn get_or_create_channel(&self, name: &str) -> Channel {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = %name, "Creating new channel");
                Channel::new(name)
            })
            .clone()
    }

    /// Append a subscriber to `channel` (creating it) and return the new id.
    pub fn add_subscriber(&self, channel: &str, client_id: &str) -> SubscriptionId {
        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                Channel::new(channel)
            });
        entry.subscribe(client_id)
    }

    /// Remove the entry with `id` from whichever channel holds it.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_subscriber_by_id(&self, id: &SubscriptionId) -> bool {
        let mut emptied = None;
        let mut removed = false;

        for mut entry in self.channels.iter_mut() {
            if entry.remove_subscription(id) {
                removed = true;
                if entry.is_empty() && !entry.is_global() {
                    emptied = Some(entry.key().clone());
                }
                break;
            }
        }

        if removed {
            trace!(subscription = %id, "Removed subscriber");
        } else {
            trace!(subscription = %id, "Subscription not found, nothing removed");
        }
        if let Some(name) = emptied {
            self.drop_if_empty(&name);
        }
        removed
    }

    /// Remove every entry for `client_id` from `channel` only.
    ///
    /// Returns the number of entries removed.
    pub fn remove_subscriber_from_channel(&self, channel: &str, client_id: &str) -> usize {
        let removed = match self.channels.get_mut(channel) {
            Some(mut entry) => entry.remove_client(client_id),
            None => {
                trace!(channel = %channel, "Channel not found, nothing removed");
                return 0;
            }
        };
        if removed > 0 {
            debug!(channel = %channel, client = %client_id, removed, "Removed client from channel");
            self.drop_if_empty(channel);
        }
        removed
    }

    /// Snapshot of the subscribers of `channel` in insertion order.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<Subscriber> {
        self.channels
            .get(channel)
            .map(|c| c.subscribers().to_vec())
            .unwrap_or_default()
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Return a snapshot of the peer at `address`, creating it if absent.
    pub fn get_or_create_peer(&self, address: &str, kind: PeerKind) -> Peer {
        self.peers(kind)
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!(peer = %address, kind = kind.as_str(), "Registering peer");
                Peer::new(address, kind)
            })
            .clone()
    }

    /// Record that `address` is interested in `channel`.
    ///
    /// Client peers are also mirrored as subscribers of `channel`; the new
    /// subscription id is returned for them.
    pub fn add_peer_channel(
        &self,
        address: &str,
        channel: &str,
        kind: PeerKind,
    ) -> Option<SubscriptionId> {
        let added = self
            .peers(kind)
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!(peer = %address, kind = kind.as_str(), "Registering peer");
                Peer::new(address, kind)
            })
            .add_channel(channel);

        debug!(peer = %address, channel = %channel, kind = kind.as_str(), added, "Peer channel");

        if kind.is_ephemeral() {
            Some(self.add_subscriber(channel, address))
        } else {
            None
        }
    }

    /// Forget the peer at `address`.
    pub fn remove_peer(&self, address: &str, kind: PeerKind) -> Option<Peer> {
        let removed = self.peers(kind).remove(address).map(|(_, peer)| peer);
        match &removed {
            Some(peer) => {
                debug!(peer = %address, kind = kind.as_str(), "Removed peer");
                if kind.is_ephemeral() {
                    for channel in peer.channels() {
                        self.remove_subscriber_from_channel(channel, address);
                    }
                }
            }
            None => trace!(peer = %address, "Peer not found, nothing removed"),
        }
        removed
    }

    /// Drop `channel` from the peer's interests.
    pub fn remove_peer_channel(&self, address: &str, channel: &str, kind: PeerKind) -> bool {
        let removed = self
            .peers(kind)
            .get_mut(address)
            .map(|mut peer| peer.remove_channel(channel))
            .unwrap_or(false);

        if removed && kind.is_ephemeral() {
            self.remove_subscriber_from_channel(channel, address);
        }
        if !removed {
            trace!(peer = %address, channel = %channel, "Peer channel not found");
        }
        removed
    }

    /// Snapshot of every server peer.
    #[must_use]
    pub fn list_server_peers(&self) -> Vec<Peer> {
        self.server_peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Snapshot of every client peer.
    #[must_use]
    pub fn list_client_peers(&self) -> Vec<Peer> {
        self.client_peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Whether a peer of `kind` is registered at `address`.
    #[must_use]
    pub fn has_peer(&self, address: &str, kind: PeerKind) -> bool {
        self.peers(kind).contains_key(address)
    }

    fn peers(&self, kind: PeerKind) -> &DashMap<String, Peer> {
        match kind {
            PeerKind::Server => &self.server_peers,
            PeerKind::Client => &self.client_peers,
        }
    }

    fn drop_if_empty(&self, name: &str) {
        if !self.config.auto_delete_empty_channels || name == GLOBAL_CHANNEL {
            return;
        }
        if self.channels.remove_if(name, |_, c| c.is_empty()).is_some() {
            debug!(channel = %name, "Deleted empty channel");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of channels, `global` included.
    pub channel_count: usize,
    /// Subscriber entries across all channels, client peer mirrors included.
    pub subscription_count: usize,
    /// Registered server peers.
    pub server_peer_count: usize,
    /// Registered client peers.
    pub client_peer_count: usize,
}
