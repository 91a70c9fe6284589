//! Batching stage between local publishes and peer delivery.
//!
//! Locally originated events and peer interest registrations arrive on two
//! channels. On every tick the accumulated events are fanned out into one
//! [`PeerEvent`] per interested server peer and handed to the publisher.

use crate::channel::ChannelId;
use crate::peer::{Peer, PeerKind};
use crate::registry::Registry;
use eventual_protocol::CloudEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A published event on its way to peers.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub channels: Vec<ChannelId>,
    pub event: Arc<CloudEvent>,
}

/// One event addressed to one server peer.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_address: String,
    /// Channel to publish into on the peer.
    pub channel: ChannelId,
    pub event: Arc<CloudEvent>,
}

/// A peer asking to be registered for a channel.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub peer_address: String,
    pub channel: ChannelId,
    pub kind: PeerKind,
}

/// Federation batching configuration.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Interval at which pending events are flushed.
    pub batch_interval: Duration,
    /// Capacity of the event, request and delivery channels.
    pub channel_capacity: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(1),
            channel_capacity: 1024,
        }
    }
}

/// Address `event` to every peer interested in one of its channels.
///
/// Each peer receives the event once, under the first channel it matches.
#[must_use]
pub fn route(event: &OutboundEvent, peers: &[Peer]) -> Vec<PeerEvent> {
    peers
        .iter()
        .filter_map(|peer| {
            event
                .channels
                .iter()
                .find(|channel| peer.is_interested_in(channel))
                .map(|channel| PeerEvent {
                    peer_address: peer.address().to_string(),
                    channel: channel.clone(),
                    event: Arc::clone(&event.event),
                })
        })
        .collect()
}

/// Remembers recently seen events so relays between mutually subscribed
/// brokers terminate.
///
/// At most `max_entries` keys are kept; when full, the oldest key is
/// forgotten first.
pub struct RelayGuard {
    seen: Mutex<SeenKeys>,
    ttl: Duration,
    max_entries: usize,
}

#[derive(Default)]
struct SeenKeys {
    at: HashMap<String, Instant>,
    /// Keys in insertion order. Each key in `at` appears here exactly once.
    order: VecDeque<(String, Instant)>,
}

impl SeenKeys {
    fn expire(&mut self, now: Instant, ttl: Duration) {
        while let Some((_, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((key, _)) = self.order.pop_front() {
            self.at.remove(&key);
        }
    }
}

impl RelayGuard {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(SeenKeys::default()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `event`. Returns `false` if it was already seen within the TTL.
    pub fn first_sighting(&self, event: &CloudEvent) -> bool {
        let now = Instant::now();
        let key = event.dedupe_key();
        let mut seen = self.lock();

        seen.expire(now, self.ttl);
        if seen.at.contains_key(&key) {
            return false;
        }
        while seen.at.len() >= self.max_entries {
            seen.pop_oldest();
        }
        seen.at.insert(key.clone(), now);
        seen.order.push_back((key, now));
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().at.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().at.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, SeenKeys> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RelayGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60), 100_000)
    }
}

/// The batching stage.
pub struct EventQueue {
    registry: Arc<Registry>,
    guard: Arc<RelayGuard>,
    events: mpsc::Receiver<OutboundEvent>,
    requests: mpsc::Receiver<PeerRequest>,
    output: mpsc::Sender<PeerEvent>,
    pending: Vec<OutboundEvent>,
    interval: Duration,
}

impl EventQueue {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        guard: Arc<RelayGuard>,
        events: mpsc::Receiver<OutboundEvent>,
        requests: mpsc::Receiver<PeerRequest>,
        output: mpsc::Sender<PeerEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            guard,
            events,
            requests,
            output,
            pending: Vec::new(),
            interval,
        }
    }

    /// Number of events waiting for the next flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accept a locally published event.
    pub fn add_event(&mut self, event: OutboundEvent) {
        self.guard.first_sighting(&event.event);
        self.pending.push(event);
    }

    /// Register the requesting peer's interest.
    pub fn handle_request(&self, request: &PeerRequest) {
        debug!(
            peer = %request.peer_address,
            channel = %request.channel,
            kind = request.kind.as_str(),
            "Peer request"
        );
        self.registry
            .add_peer_channel(&request.peer_address, &request.channel, request.kind);
    }

    /// Fan pending events out to interested server peers.
    ///
    /// Returns the number of peer events emitted. Stops early if the
    /// publisher is gone.
    pub async fn flush(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let peers = self.registry.list_server_peers();
        let batch = std::mem::take(&mut self.pending);
        if peers.is_empty() {
            trace!(events = batch.len(), "No server peers, dropping batch");
            return 0;
        }

        let mut emitted = 0;
        for event in &batch {
            for peer_event in route(event, &peers) {
                if self.output.send(peer_event).await.is_err() {
                    warn!("Peer publisher stopped, discarding remaining batch");
                    return emitted;
                }
                emitted += 1;
            }
        }
        trace!(events = batch.len(), emitted, "Flushed federation batch");
        emitted
    }

    /// Run until both input channels close.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut requests_open = true;

        while events_open || requests_open {
            tokio::select! {
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.add_event(event),
                    None => events_open = false,
                },
                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(&request),
                    None => requests_open = false,
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        debug!("Federation queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::GLOBAL_CHANNEL;

    fn outbound(id: &str, channels: &[&str]) -> OutboundEvent {
        OutboundEvent {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            event: Arc::new(CloudEvent::new(id, "test", "t")),
        }
    }

    fn peer(address: &str, channels: &[&str]) -> Peer {
        let mut peer = Peer::new(address, PeerKind::Server);
        for channel in channels {
            peer.add_channel(*channel);
        }
        peer
    }

    #[test]
    fn test_route_by_interest() {
        let peers = vec![
            peer("a", &["weather"]),
            peer("b", &["sports"]),
            peer("c", &[GLOBAL_CHANNEL]),
        ];

        let routed = route(&outbound("1", &["weather", "alerts"]), &peers);
        let addresses: Vec<_> = routed.iter().map(|p| p.peer_address.as_str()).collect();
        assert_eq!(addresses, vec!["a", "c"]);
        assert!(routed.iter().all(|p| p.channel == "weather"));
    }

    #[test]
    fn test_route_single_delivery_per_peer() {
        let peers = vec![peer("a", &["x", "y"])];
        let routed = route(&outbound("1", &["x", "y"]), &peers);
        assert_eq!(routed.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_guard() {
        let guard = RelayGuard::default();
        let event = CloudEvent::new("1", "svc", "t");
        assert!(guard.first_sighting(&event));
        assert!(!guard.first_sighting(&event));
        assert!(guard.first_sighting(&CloudEvent::new("1", "other", "t")));
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test]
    async fn test_relay_guard_is_bounded() {
        let guard = RelayGuard::new(Duration::from_secs(600), 10);
        for i in 0..1000 {
            assert!(guard.first_sighting(&CloudEvent::new(i.to_string(), "svc", "t")));
            assert!(guard.len() <= 10);
        }
        assert_eq!(guard.len(), 10);

        // The newest keys survive, the oldest were forgotten.
        assert!(!guard.first_sighting(&CloudEvent::new("999", "svc", "t")));
        assert!(guard.first_sighting(&CloudEvent::new("0", "svc", "t")));
        assert_eq!(guard.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_guard_expires_oldest_first() {
        let guard = RelayGuard::new(Duration::from_secs(5), 100);
        assert!(guard.first_sighting(&CloudEvent::new("old", "svc", "t")));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(guard.first_sighting(&CloudEvent::new("new", "svc", "t")));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(!guard.first_sighting(&CloudEvent::new("new", "svc", "t")));
        assert_eq!(guard.len(), 1);
        assert!(guard.first_sighting(&CloudEvent::new("old", "svc", "t")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_guard_forgets_after_ttl() {
        let guard = RelayGuard::new(Duration::from_secs(5), 1);
        let event = CloudEvent::new("1", "svc", "t");
        assert!(guard.first_sighting(&event));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(guard.first_sighting(&event));
    }

    #[tokio::test]
    async fn test_flush_emits_event_per_peer() {
        let registry = Arc::new(Registry::new());
        registry.add_peer_channel("peer-1", "weather", PeerKind::Server);
        registry.add_peer_channel("peer-2", "weather", PeerKind::Server);

        let (_events_tx, events_rx) = mpsc::channel(8);
        let (_requests_tx, requests_rx) = mpsc::channel(8);
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let mut queue = EventQueue::new(
            registry,
            Arc::new(RelayGuard::default()),
            events_rx,
            requests_rx,
            output_tx,
            Duration::from_millis(1),
        );

        queue.add_event(outbound("1", &["weather"]));
        queue.add_event(outbound("2", &["sports"]));
        assert_eq!(queue.pending_count(), 2);

        assert_eq!(queue.flush().await, 2);
        assert_eq!(queue.pending_count(), 0);

        let mut addresses = vec![
            output_rx.recv().await.unwrap().peer_address,
            output_rx.recv().await.unwrap().peer_address,
        ];
        addresses.sort();
        assert_eq!(addresses, vec!["peer-1", "peer-2"]);
    }

    #[tokio::test]
    async fn test_run_handles_requests_and_events() {
        let registry = Arc::new(Registry::new());
        let (events_tx, events_rx) = mpsc::channel(8);
        let (requests_tx, requests_rx) = mpsc::channel(8);
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let queue = EventQueue::new(
            Arc::clone(&registry),
            Arc::new(RelayGuard::default()),
            events_rx,
            requests_rx,
            output_tx,
            Duration::from_millis(1),
        );
        let task = tokio::spawn(queue.run());

        requests_tx
            .send(PeerRequest {
                peer_address: "peer-1".into(),
                channel: "weather".into(),
                kind: PeerKind::Server,
            })
            .await
            .unwrap();

        // Wait for the request to land before publishing.
        while !registry.has_peer("peer-1", PeerKind::Server) {
            tokio::task::yield_now().await;
        }

        events_tx.send(outbound("1", &["weather"])).await.unwrap();
        let delivered = output_rx.recv().await.unwrap();
        assert_eq!(delivered.peer_address, "peer-1");
        assert_eq!(delivered.event.id, "1");

        drop(events_tx);
        drop(requests_tx);
        task.await.unwrap();
    }
}
