//! Peer federation endpoints.
//!
//! [`PeerReceiver`] answers RPC calls from other brokers. [`PeerPublisher`]
//! drains the federation queue and pushes each event to its peer.

use crate::config::UpstreamConfig;
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use eventual_core::federation::route;
use eventual_core::profile::Timer;
use eventual_core::{
    OutboundEvent, Origin, PeerEvent, PeerKind, PeerRequest, PoolHandle, Registry, RelayGuard,
    TokenAuthority,
};
use eventual_protocol::client::validate_channel_name;
use eventual_protocol::CloudEvent;
use eventual_transport::{PeerService, RpcClient, RpcError, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Serves `Subscribe` and `Publish` calls from peer brokers.
pub struct PeerReceiver {
    registry: Arc<Registry>,
    auth: Arc<dyn TokenAuthority>,
    pool: PoolHandle,
    guard: Arc<RelayGuard>,
    requests: mpsc::Sender<PeerRequest>,
    relay: mpsc::Sender<PeerEvent>,
}

impl PeerReceiver {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<dyn TokenAuthority>,
        pool: PoolHandle,
        guard: Arc<RelayGuard>,
        requests: mpsc::Sender<PeerRequest>,
        relay: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            registry,
            auth,
            pool,
            guard,
            requests,
            relay,
        }
    }

    fn authenticate(&self, token: &str) -> Result<(), RpcError> {
        self.auth.verify_present(Some(token)).map_err(|e| {
            metrics::record_auth_failure("rpc");
            RpcError::Unauthenticated(e.to_string())
        })
    }
}

fn check_channel(channel: &str) -> Result<(), RpcError> {
    validate_channel_name(channel).map_err(|reason| RpcError::InvalidArgument(reason.to_string()))
}

#[async_trait]
impl PeerService for PeerReceiver {
    async fn subscribe(
        &self,
        token: &str,
        channel: &str,
        peer_server: &str,
    ) -> Result<String, RpcError> {
        self.authenticate(token)?;
        check_channel(channel)?;
        if peer_server.is_empty() {
            return Err(RpcError::InvalidArgument("peer address is required".into()));
        }

        self.registry
            .add_peer_channel(peer_server, channel, PeerKind::Server);
        let request = PeerRequest {
            peer_address: peer_server.to_string(),
            channel: channel.to_string(),
            kind: PeerKind::Server,
        };
        if self.requests.send(request).await.is_err() {
            warn!(peer = %peer_server, "Federation queue closed, request not recorded");
        }

        info!(peer = %peer_server, channel = %channel, "Peer subscribed");
        Ok(String::new())
    }

    async fn publish(
        &self,
        token: &str,
        subscription_id: &str,
        channel: &str,
        mut event: CloudEvent,
    ) -> Result<String, RpcError> {
        self.authenticate(token)?;
        check_channel(channel)?;
        event
            .normalize()
            .map_err(|e| RpcError::InvalidArgument(e.to_string()))?;

        if !self.guard.first_sighting(&event) {
            trace!(event = %event.dedupe_key(), "Event already seen, not relaying");
            return Ok(subscription_id.to_string());
        }

        let event = Arc::new(event);
        self.pool
            .publish(vec![channel.to_string()], Arc::clone(&event), Origin::Peer)
            .await
            .map_err(|e| RpcError::Internal(e.to_string()))?;

        let outbound = OutboundEvent {
            channels: vec![channel.to_string()],
            event,
        };
        for peer_event in route(&outbound, &self.registry.list_server_peers()) {
            if self.relay.send(peer_event).await.is_err() {
                warn!("Peer publisher stopped, not relaying");
                break;
            }
        }

        Ok(subscription_id.to_string())
    }
}

/// Result of one outbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The peer was no longer registered.
    Skipped,
    Failed,
}

/// Pushes [`PeerEvent`]s to peer brokers, one call each, without retries.
pub struct PeerPublisher {
    registry: Arc<Registry>,
    auth: Arc<dyn TokenAuthority>,
    clients: DashMap<String, Arc<Mutex<Option<RpcClient>>>>,
    call_timeout: Duration,
    limit: Arc<Semaphore>,
    profiling: bool,
}

impl PeerPublisher {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<dyn TokenAuthority>,
        call_timeout: Duration,
        max_concurrent: usize,
        profiling: bool,
    ) -> Self {
        Self {
            registry,
            auth,
            clients: DashMap::new(),
            call_timeout,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            profiling,
        }
    }

    /// Deliver events until the queue closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await else {
                break;
            };
            let publisher = Arc::clone(&self);
            tokio::spawn(async move {
                publisher.deliver(event).await;
                drop(permit);
            });
        }
        debug!("Peer publisher stopped");
    }

    /// Deliver one event. Failures are logged and dropped.
    pub async fn deliver(&self, event: PeerEvent) -> DeliveryOutcome {
        if !self.registry.has_peer(&event.peer_address, PeerKind::Server) {
            trace!(peer = %event.peer_address, "Peer no longer registered, skipping");
            metrics::record_peer_delivery("skipped");
            return DeliveryOutcome::Skipped;
        }

        let _timer = Timer::start("peer_delivery", self.profiling);
        match self.call(&event).await {
            Ok(()) => {
                trace!(peer = %event.peer_address, event = %event.event.id, "Delivered to peer");
                metrics::record_peer_delivery("ok");
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    peer = %event.peer_address,
                    channel = %event.channel,
                    event = %event.event.id,
                    error = %e,
                    "Peer delivery failed"
                );
                metrics::record_peer_delivery("error");
                DeliveryOutcome::Failed
            }
        }
    }

    async fn call(&self, event: &PeerEvent) -> Result<(), TransportError> {
        let token = self
            .auth
            .sign()
            .map_err(|e| RpcError::Internal(e.to_string()))?;

        let slot = Arc::clone(
            self.clients
                .entry(event.peer_address.clone())
                .or_default()
                .value(),
        );
        let mut slot = slot.lock().await;

        let mut client = match slot.take() {
            Some(client) => client,
            None => RpcClient::connect(&event.peer_address, self.call_timeout).await?,
        };
        client
            .publish(&token, "", &event.channel, (*event.event).clone())
            .await?;
        // A client is only cached again after a successful call.
        *slot = Some(client);
        Ok(())
    }
}

/// Ask each upstream broker to push its events on the configured channels.
///
/// Every `(upstream, channel)` pair is tried up to `attempts` times.
pub async fn subscribe_upstreams(
    upstreams: Vec<UpstreamConfig>,
    advertise: String,
    auth: Arc<dyn TokenAuthority>,
    call_timeout: Duration,
    attempts: u32,
    retry_interval: Duration,
) {
    for upstream in upstreams {
        for channel in &upstream.channels {
            let subscribed = subscribe_with_retry(
                &upstream.address,
                channel,
                &advertise,
                auth.as_ref(),
                call_timeout,
                attempts,
                retry_interval,
            )
            .await;
            if subscribed {
                info!(upstream = %upstream.address, channel = %channel, "Subscribed to upstream");
            } else {
                error!(upstream = %upstream.address, channel = %channel, "Giving up on upstream subscription");
            }
        }
    }
}

async fn subscribe_with_retry(
    address: &str,
    channel: &str,
    advertise: &str,
    auth: &dyn TokenAuthority,
    call_timeout: Duration,
    attempts: u32,
    retry_interval: Duration,
) -> bool {
    for attempt in 1..=attempts.max(1) {
        let result: Result<String, TransportError> = async {
            let token = auth.sign().map_err(|e| RpcError::Internal(e.to_string()))?;
            let mut client = RpcClient::connect(address, call_timeout).await?;
            client.subscribe(&token, channel, advertise).await
        }
        .await;

        match result {
            Ok(_) => return true,
            Err(e) => {
                warn!(upstream = %address, channel = %channel, attempt, error = %e, "Upstream subscribe failed");
                if attempt < attempts {
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
    false
}
