//! Worker pool executing subscribe, unsubscribe, publish and history requests.
//!
//! Requests arrive on four small bounded channels. A fixed set of workers
//! competes for them; whichever worker wins a request runs it to completion.
//! Workers are supervised: a panic is logged and the worker restarted.

use crate::channel::{ChannelId, Subscriber, SubscriptionId, GLOBAL_CHANNEL};
use crate::federation::OutboundEvent;
use crate::profile::Timer;
use crate::registry::Registry;
use crate::replay::ReplayQueue;
use crate::session::{DeliveryError, Outbound, SessionHandle, SessionId};
use eventual_protocol::CloudEvent;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker has stopped and the request channels are closed.
    #[error("worker pool is shut down")]
    Closed,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers.
    pub workers: usize,
    /// Capacity of each request channel.
    pub queue_capacity: usize,
    /// Interval between Cleaner sweeps.
    pub cleaner_interval: Duration,
    /// How long history replay waits for room in a session's queue.
    pub history_send_timeout: Duration,
    /// Log durations of request handling.
    pub profiling: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            queue_capacity: 4,
            cleaner_interval: Duration::from_secs(120),
            history_send_timeout: Duration::from_secs(5),
            profiling: false,
        }
    }
}

/// Where a published event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client of this broker; the event is also offered to peers.
    Local,
    /// A peer broker; the event is delivered locally only.
    Peer,
}

#[derive(Debug)]
pub struct SubscribeRequest {
    pub channels: Vec<ChannelId>,
    pub session: SessionHandle,
}

/// Which subscriptions an unsubscribe removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsubscribeScope {
    Channels(Vec<ChannelId>),
    All,
}

#[derive(Debug)]
pub struct UnsubscribeRequest {
    pub scope: UnsubscribeScope,
    pub session: SessionHandle,
}

#[derive(Debug)]
pub struct PublishRequest {
    pub channels: Vec<ChannelId>,
    pub event: Arc<CloudEvent>,
    pub origin: Origin,
}

#[derive(Debug)]
pub struct HistoryRequest {
    pub channel: ChannelId,
    pub consume: bool,
    pub session: SessionHandle,
}

/// Every request kind a worker can execute.
#[derive(Debug)]
pub enum PoolRequest {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    History(HistoryRequest),
}

impl PoolRequest {
    fn kind(&self) -> &'static str {
        match self {
            PoolRequest::Subscribe(_) => "subscribe",
            PoolRequest::Unsubscribe(_) => "unsubscribe",
            PoolRequest::Publish(_) => "publish",
            PoolRequest::History(_) => "history",
        }
    }
}

/// Outcome of a single publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    /// Subscribers whose session was gone and were removed.
    pub evicted: usize,
    /// Deliveries skipped because the session's queue was full.
    pub dropped: usize,
}

/// Cloneable submission side of the pool.
#[derive(Clone)]
pub struct PoolHandle {
    subscribe: mpsc::Sender<SubscribeRequest>,
    unsubscribe: mpsc::Sender<UnsubscribeRequest>,
    publish: mpsc::Sender<PublishRequest>,
    history: mpsc::Sender<HistoryRequest>,
}

impl PoolHandle {
    /// Subscribe `session` to `channels`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has shut down.
    pub async fn subscribe(
        &self,
        channels: Vec<ChannelId>,
        session: SessionHandle,
    ) -> Result<(), PoolError> {
        self.subscribe
            .send(SubscribeRequest { channels, session })
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Remove `session`'s subscriptions on `channels`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has shut down.
    pub async fn unsubscribe(
        &self,
        channels: Vec<ChannelId>,
        session: SessionHandle,
    ) -> Result<(), PoolError> {
        self.send_unsubscribe(UnsubscribeScope::Channels(channels), session)
            .await
    }

    /// Remove every subscription held by `session`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has shut down.
    pub async fn unsubscribe_all(&self, session: SessionHandle) -> Result<(), PoolError> {
        self.send_unsubscribe(UnsubscribeScope::All, session).await
    }

    /// Publish `event` to `channels` and the global channel.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has shut down.
    pub async fn publish(
        &self,
        channels: Vec<ChannelId>,
        event: Arc<CloudEvent>,
        origin: Origin,
    ) -> Result<(), PoolError> {
        self.publish
            .send(PublishRequest {
                channels,
                event,
                origin,
            })
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Replay `channel`'s retained events to `session`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool has shut down.
    pub async fn history(
        &self,
        channel: ChannelId,
        consume: bool,
        session: SessionHandle,
    ) -> Result<(), PoolError> {
        self.history
            .send(HistoryRequest {
                channel,
                consume,
                session,
            })
            .await
            .map_err(|_| PoolError::Closed)
    }

    async fn send_unsubscribe(
        &self,
        scope: UnsubscribeScope,
        session: SessionHandle,
    ) -> Result<(), PoolError> {
        self.unsubscribe
            .send(UnsubscribeRequest { scope, session })
            .await
            .map_err(|_| PoolError::Closed)
    }
}

struct Receivers {
    subscribe: Mutex<mpsc::Receiver<SubscribeRequest>>,
    unsubscribe: Mutex<mpsc::Receiver<UnsubscribeRequest>>,
    publish: Mutex<mpsc::Receiver<PublishRequest>>,
    history: Mutex<mpsc::Receiver<HistoryRequest>>,
}

impl Receivers {
    /// Wait for the next request on any channel. `None` once all are closed.
    async fn next(&self) -> Option<PoolRequest> {
        tokio::select! {
            Some(r) = recv(&self.subscribe) => Some(PoolRequest::Subscribe(r)),
            Some(r) = recv(&self.unsubscribe) => Some(PoolRequest::Unsubscribe(r)),
            Some(r) = recv(&self.publish) => Some(PoolRequest::Publish(r)),
            Some(r) = recv(&self.history) => Some(PoolRequest::History(r)),
            else => None,
        }
    }
}

async fn recv<T>(rx: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

/// State shared by every worker and the Cleaner.
pub struct PoolCore {
    registry: Arc<Registry>,
    replay: Arc<ReplayQueue>,
    sessions: RwLock<HashMap<SubscriptionId, SessionHandle>>,
    federation: Option<mpsc::Sender<OutboundEvent>>,
    config: PoolConfig,
}

impl PoolCore {
    fn new(
        registry: Arc<Registry>,
        replay: Arc<ReplayQueue>,
        federation: Option<mpsc::Sender<OutboundEvent>>,
        config: PoolConfig,
    ) -> Self {
        Self {
            registry,
            replay,
            sessions: RwLock::new(HashMap::new()),
            federation,
            config,
        }
    }

    /// Number of live subscription → session mappings.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Execute one request.
    pub async fn handle(&self, request: PoolRequest) {
        let _timer = Timer::start(request.kind(), self.config.profiling);
        match request {
            PoolRequest::Subscribe(req) => self.subscribe(req),
            PoolRequest::Unsubscribe(req) => self.unsubscribe(req),
            PoolRequest::Publish(req) => {
                self.publish(req).await;
            }
            PoolRequest::History(req) => self.history(req).await,
        }
    }

    fn subscribe(&self, req: SubscribeRequest) {
        let session = req.session;
        if session.is_closed() {
            debug!(session = %session.id(), "Ignoring subscribe from closed session");
            return;
        }

        for channel in dedupe(req.channels) {
            // Publishers resolve registry entries under the read lock, so an
            // entry must not be observable before its mapping exists.
            let id = {
                let mut sessions = self.write_sessions();
                let id = self.registry.add_subscriber(&channel, session.client_id());
                sessions.insert(id.clone(), session.clone());
                session.record_subscription(channel.clone(), id.clone());
                id
            };
            debug!(
                session = %session.id(),
                channel = %channel,
                subscription = %id,
                "Subscribed"
            );
        }
    }

    fn unsubscribe(&self, req: UnsubscribeRequest) {
        let ids = match &req.scope {
            UnsubscribeScope::Channels(channels) => req.session.take_subscriptions(channels),
            UnsubscribeScope::All => req.session.take_all_subscriptions(),
        };

        if ids.is_empty() {
            trace!(session = %req.session.id(), scope = ?req.scope, "Nothing to unsubscribe");
            return;
        }

        {
            let mut sessions = self.write_sessions();
            for id in &ids {
                sessions.remove(id);
            }
        }
        for id in &ids {
            self.registry.remove_subscriber_by_id(id);
        }
        debug!(session = %req.session.id(), removed = ids.len(), "Unsubscribed");
    }

    /// Fan `req.event` out to every subscriber of its channels and `global`.
    pub async fn publish(&self, req: PublishRequest) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        let mut reached: HashSet<SessionId> = HashSet::new();

        for channel in target_channels(&req.channels) {
            self.replay.enqueue(&channel, Arc::clone(&req.event));

            for subscriber in self.registry.subscribers(&channel) {
                let session = self
                    .read_sessions()
                    .get(&subscriber.subscription_id)
                    .cloned();

                let Some(session) = session.filter(|s| !s.is_closed()) else {
                    self.evict(&subscriber);
                    outcome.evicted += 1;
                    continue;
                };

                if !reached.insert(session.id()) {
                    continue;
                }

                match session.deliver(Outbound::Event(Arc::clone(&req.event))) {
                    Ok(()) => outcome.delivered += 1,
                    Err(DeliveryError::Full) => {
                        warn!(
                            session = %session.id(),
                            channel = %channel,
                            event = %req.event.id,
                            "Outbound queue full, dropping event"
                        );
                        outcome.dropped += 1;
                    }
                    Err(_) => {
                        self.evict(&subscriber);
                        outcome.evicted += 1;
                    }
                }
            }
        }

        if req.origin == Origin::Local {
            if let Some(federation) = &self.federation {
                let outbound = OutboundEvent {
                    channels: req.channels,
                    event: req.event,
                };
                if federation.send(outbound).await.is_err() {
                    warn!("Federation queue closed, event not offered to peers");
                }
            }
        }

        trace!(
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            dropped = outcome.dropped,
            "Published"
        );
        outcome
    }

    async fn history(&self, req: HistoryRequest) {
        let events = match self.replay.iter(&req.channel, req.consume) {
            Ok(events) => events,
            Err(e) => {
                debug!(session = %req.session.id(), error = %e, "History unavailable");
                return;
            }
        };

        let total = events.len();
        for (sent, event) in events.enumerate() {
            if let Err(e) = req
                .session
                .deliver_wait(Outbound::Event(event), self.config.history_send_timeout)
                .await
            {
                warn!(
                    session = %req.session.id(),
                    channel = %req.channel,
                    sent,
                    total,
                    error = %e,
                    "History replay interrupted"
                );
                return;
            }
        }
        debug!(session = %req.session.id(), channel = %req.channel, total, "History replayed");
    }

    /// Drop every mapping whose session has closed. Returns how many were removed.
    pub fn clean(&self) -> usize {
        let stale: Vec<SubscriptionId> = {
            let mut sessions = self.write_sessions();
            let stale: Vec<_> = sessions
                .iter()
                .filter(|(_, s)| s.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                sessions.remove(id);
            }
            stale
        };

        for id in &stale {
            self.registry.remove_subscriber_by_id(id);
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "Cleaner removed closed sessions");
        }
        stale.len()
    }

    fn evict(&self, subscriber: &Subscriber) {
        debug!(
            subscription = %subscriber.subscription_id,
            client = %subscriber.client_id,
            "Removing dead subscriber"
        );
        self.write_sessions().remove(&subscriber.subscription_id);
        self.registry
            .remove_subscriber_by_id(&subscriber.subscription_id);
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SubscriptionId, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriptionId, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Explicit channels in order, without repeats, followed by `global`.
fn target_channels(channels: &[ChannelId]) -> Vec<ChannelId> {
    let mut targets = dedupe(channels.to_vec());
    if !targets.iter().any(|c| c == GLOBAL_CHANNEL) {
        targets.push(GLOBAL_CHANNEL.to_string());
    }
    targets
}

fn dedupe(channels: Vec<ChannelId>) -> Vec<ChannelId> {
    let mut seen = HashSet::new();
    channels
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// The worker pool.
pub struct WorkerPool {
    core: Arc<PoolCore>,
    receivers: Arc<Receivers>,
    handle: PoolHandle,
}

impl WorkerPool {
    /// Create a pool with default configuration.
    #[must_use]
    pub fn new(registry: Arc<Registry>, replay: Arc<ReplayQueue>) -> Self {
        Self::with_config(registry, replay, None, PoolConfig::default())
    }

    /// Create a pool. Locally published events go to `federation` when set.
    #[must_use]
    pub fn with_config(
        registry: Arc<Registry>,
        replay: Arc<ReplayQueue>,
        federation: Option<mpsc::Sender<OutboundEvent>>,
        config: PoolConfig,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(capacity);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(capacity);
        let (publish_tx, publish_rx) = mpsc::channel(capacity);
        let (history_tx, history_rx) = mpsc::channel(capacity);

        Self {
            core: Arc::new(PoolCore::new(registry, replay, federation, config)),
            receivers: Arc::new(Receivers {
                subscribe: Mutex::new(subscribe_rx),
                unsubscribe: Mutex::new(unsubscribe_rx),
                publish: Mutex::new(publish_rx),
                history: Mutex::new(history_rx),
            }),
            handle: PoolHandle {
                subscribe: subscribe_tx,
                unsubscribe: unsubscribe_tx,
                publish: publish_tx,
                history: history_tx,
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn core(&self) -> Arc<PoolCore> {
        Arc::clone(&self.core)
    }

    /// Spawn the supervised workers and the Cleaner.
    ///
    /// Workers exit once every [`PoolHandle`] is dropped.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let workers = self.core.config.workers.max(1);
        info!(workers, "Starting worker pool");

        let mut tasks: Vec<_> = (0..workers)
            .map(|id| {
                let core = Arc::clone(&self.core);
                let receivers = Arc::clone(&self.receivers);
                tokio::spawn(supervise(format!("worker-{id}"), move || {
                    worker_loop(Arc::clone(&core), Arc::clone(&receivers))
                }))
            })
            .collect();

        tasks.push(tokio::spawn(run_cleaner(
            Arc::downgrade(&self.core),
            self.core.config.cleaner_interval,
        )));
        tasks
    }
}

async fn worker_loop(core: Arc<PoolCore>, receivers: Arc<Receivers>) {
    while let Some(request) = receivers.next().await {
        core.handle(request).await;
    }
}

/// Run the future produced by `make` until it returns, restarting it after panics.
pub async fn supervise<F, Fut>(name: String, make: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        match AssertUnwindSafe(make()).catch_unwind().await {
            Ok(()) => {
                debug!(task = %name, "Task finished");
                return;
            }
            Err(panic) => {
                error!(task = %name, panic = %panic_message(panic.as_ref()), "Task panicked, restarting");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_cleaner(core: std::sync::Weak<PoolCore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(core) = core.upgrade() else {
            debug!("Cleaner stopped");
            return;
        };
        core.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str) -> Arc<CloudEvent> {
        Arc::new(CloudEvent::new(id, "test", "test.event"))
    }

    fn core() -> (PoolCore, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let core = PoolCore::new(
            Arc::clone(&registry),
            Arc::new(ReplayQueue::new()),
            None,
            PoolConfig::default(),
        );
        (core, registry)
    }

    fn session(client: &str) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (session, rx) = SessionHandle::new(client, 32);
        session.mark_open();
        (session, rx)
    }

    fn subscribe(core: &PoolCore, session: &SessionHandle, channels: &[&str]) {
        core.subscribe(SubscribeRequest {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            session: session.clone(),
        });
    }

    fn publish_req(channels: &[&str], event: Arc<CloudEvent>) -> PublishRequest {
        PublishRequest {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            event,
            origin: Origin::Local,
        }
    }

    fn received_id(rx: &mut mpsc::Receiver<Outbound>) -> Option<String> {
        match rx.try_recv().ok()? {
            Outbound::Event(e) => Some(e.id.clone()),
            Outbound::InvalidRequest => None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_once() {
        let (core, _) = core();
        let (a, mut rx) = session("a");
        subscribe(&core, &a, &["weather"]);

        let outcome = core.publish(publish_req(&["weather"], event("e1"))).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(received_id(&mut rx), Some("e1".to_string()));
        assert_eq!(received_id(&mut rx), None);
    }

    #[tokio::test]
    async fn test_global_subscriber_receives_everything() {
        let (core, _) = core();
        let (g, mut rx) = session("g");
        subscribe(&core, &g, &[GLOBAL_CHANNEL]);

        core.publish(publish_req(&["other"], event("e1"))).await;
        assert_eq!(received_id(&mut rx), Some("e1".to_string()));
    }

    #[tokio::test]
    async fn test_at_most_once_per_publish() {
        let (core, _) = core();
        let (a, mut rx) = session("a");
        subscribe(&core, &a, &["weather", GLOBAL_CHANNEL]);

        core.publish(publish_req(&["weather", "weather"], event("e1"))).await;
        assert_eq!(received_id(&mut rx), Some("e1".to_string()));
        assert_eq!(received_id(&mut rx), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_selective_and_idempotent() {
        let (core, registry) = core();
        let (a, mut rx) = session("a");
        subscribe(&core, &a, &["x", "y"]);

        for _ in 0..2 {
            core.unsubscribe(UnsubscribeRequest {
                scope: UnsubscribeScope::Channels(vec!["x".into()]),
                session: a.clone(),
            });
        }
        assert_eq!(registry.subscriber_count("x"), 0);
        assert_eq!(registry.subscriber_count("y"), 1);

        core.publish(publish_req(&["x"], event("e1"))).await;
        assert_eq!(received_id(&mut rx), None);
        core.publish(publish_req(&["y"], event("e2"))).await;
        assert_eq!(received_id(&mut rx), Some("e2".to_string()));

        core.unsubscribe(UnsubscribeRequest {
            scope: UnsubscribeScope::All,
            session: a.clone(),
        });
        assert_eq!(core.session_count(), 0);
        assert_eq!(registry.stats().subscription_count, 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_self_healed() {
        let (core, registry) = core();
        let (a, rx_a) = session("a");
        let (b, mut rx_b) = session("b");
        subscribe(&core, &a, &["weather"]);
        subscribe(&core, &b, &["weather"]);

        drop(rx_a);
        let outcome = core.publish(publish_req(&["weather"], event("e1"))).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(received_id(&mut rx_b), Some("e1".to_string()));

        let remaining = registry.subscribers("weather");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "b");
        assert_eq!(core.session_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_mapping_is_self_healed() {
        let (core, registry) = core();
        registry.add_subscriber("weather", "ghost");

        let outcome = core.publish(publish_req(&["weather"], event("e1"))).await;
        assert_eq!(outcome.evicted, 1);
        assert_eq!(registry.subscriber_count("weather"), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_evicting() {
        let (core, registry) = core();
        let (a, _rx) = SessionHandle::new("a", 1);
        a.mark_open();
        subscribe(&core, &a, &["weather"]);

        core.publish(publish_req(&["weather"], event("e1"))).await;
        let outcome = core.publish(publish_req(&["weather"], event("e2"))).await;
        assert_eq!(outcome.dropped, 1);
        assert_eq!(registry.subscriber_count("weather"), 1);
    }

    #[tokio::test]
    async fn test_history_in_order() {
        let (core, _) = core();
        for id in ["e1", "e2", "e3"] {
            core.publish(publish_req(&["a"], event(id))).await;
        }

        let (s, mut rx) = session("s");
        core.history(HistoryRequest {
            channel: "a".into(),
            consume: false,
            session: s,
        })
        .await;

        let got: Vec<_> = std::iter::from_fn(|| received_id(&mut rx)).collect();
        assert_eq!(got, vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn test_history_unknown_channel_delivers_nothing() {
        let (core, _) = core();
        let (s, mut rx) = session("s");
        core.history(HistoryRequest {
            channel: "never".into(),
            consume: false,
            session: s,
        })
        .await;
        assert!(received_id(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_clean_removes_closed_sessions() {
        let (core, registry) = core();
        let (a, _rx_a) = session("a");
        let (b, _rx_b) = session("b");
        subscribe(&core, &a, &["x"]);
        subscribe(&core, &b, &["x"]);

        a.close();
        assert_eq!(core.clean(), 1);
        assert_eq!(core.session_count(), 1);
        assert_eq!(registry.subscriber_count("x"), 1);
        assert_eq!(core.clean(), 0);
    }

    #[tokio::test]
    async fn test_local_publish_feeds_federation() {
        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::channel(4);
        let core = PoolCore::new(
            registry,
            Arc::new(ReplayQueue::new()),
            Some(tx),
            PoolConfig::default(),
        );

        core.publish(publish_req(&["a"], event("local"))).await;
        core.publish(PublishRequest {
            channels: vec!["a".into()],
            event: event("remote"),
            origin: Origin::Peer,
        })
        .await;

        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.event.id, "local");
        assert_eq!(outbound.channels, vec!["a".to_string()]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_from_closed_session_is_ignored() {
        let (core, registry) = core();
        let (a, _rx) = session("a");
        a.close();
        subscribe(&core, &a, &["x"]);
        assert_eq!(registry.subscriber_count("x"), 0);
        assert_eq!(core.session_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_end_to_end() {
        let registry = Arc::new(Registry::new());
        let pool = WorkerPool::with_config(
            Arc::clone(&registry),
            Arc::new(ReplayQueue::new()),
            None,
            PoolConfig {
                workers: 4,
                ..PoolConfig::default()
            },
        );
        let tasks = pool.start();
        let handle = pool.handle();

        let (a, mut rx) = session("a");
        handle.subscribe(vec!["weather".into()], a.clone()).await.unwrap();
        while registry.subscriber_count("weather") == 0 {
            tokio::task::yield_now().await;
        }

        handle
            .publish(vec!["weather".into()], event("e1"), Origin::Local)
            .await
            .unwrap();
        match rx.recv().await {
            Some(Outbound::Event(e)) => assert_eq!(e.id, "e1"),
            other => panic!("unexpected {other:?}"),
        }

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_subscription_not_visible_before_its_mapping() {
        let (core, registry) = core();
        let (a, mut rx) = session("a");

        std::thread::scope(|scope| {
            let publisher_view = core.read_sessions();
            let subscriber = scope.spawn(|| subscribe(&core, &a, &["weather"]));

            std::thread::sleep(Duration::from_millis(50));
            // Blocked on the session table: the registry must not show the
            // entry yet, or a concurrent publish would evict it.
            assert_eq!(registry.subscriber_count("weather"), 0);

            drop(publisher_view);
            subscriber.join().unwrap();
        });

        let outcome = core.publish(publish_req(&["weather"], event("e1"))).await;
        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(received_id(&mut rx), Some("e1".to_string()));
        assert_eq!(a.subscriptions().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_keep_views_consistent() {
        let registry = Arc::new(Registry::new());
        let pool = WorkerPool::with_config(
            Arc::clone(&registry),
            Arc::new(ReplayQueue::new()),
            None,
            PoolConfig {
                workers: 8,
                ..PoolConfig::default()
            },
        );
        let core = pool.core();
        let mut tasks = pool.start();
        let cleaner = tasks.pop().unwrap();

        let mut sessions = Vec::new();
        let mut clients = Vec::new();
        for n in 0..8 {
            let (s, rx) = session(&format!("client-{n}"));
            sessions.push((s.clone(), rx));

            let handle = pool.handle();
            clients.push(tokio::spawn(async move {
                for i in 0..50 {
                    let weather = vec!["weather".to_string()];
                    handle.subscribe(weather.clone(), s.clone()).await.unwrap();
                    handle
                        .publish(weather.clone(), event(&format!("{n}-{i}")), Origin::Local)
                        .await
                        .unwrap();
                    if (i + n) % 3 != 0 {
                        handle.unsubscribe(weather, s.clone()).await.unwrap();
                    }
                }
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        // Closing the request channels lets the workers drain and exit.
        drop(pool);
        for task in tasks {
            task.await.unwrap();
        }
        cleaner.abort();

        let recorded: HashSet<SubscriptionId> = sessions
            .iter()
            .flat_map(|(s, _)| s.subscriptions())
            .map(|(_, id)| id)
            .collect();
        let mapped: HashSet<SubscriptionId> = core.read_sessions().keys().cloned().collect();
        let registered: HashSet<SubscriptionId> = registry
            .subscribers("weather")
            .into_iter()
            .map(|s| s.subscription_id)
            .collect();
        assert_eq!(recorded, mapped);
        assert_eq!(mapped, registered);

        for (_, rx) in &mut sessions {
            while rx.try_recv().is_ok() {}
        }
        let outcome = core.publish(publish_req(&["weather"], event("final"))).await;
        assert_eq!(outcome.evicted, 0);
        for (s, rx) in &mut sessions {
            let subscribed = !s.subscriptions().is_empty();
            assert_eq!(received_id(rx).is_some(), subscribed, "{}", s.client_id());
        }
    }

    #[tokio::test]
    async fn test_supervise_restarts_after_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        supervise("flaky".to_string(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            }
        })
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_target_channels() {
        assert_eq!(
            target_channels(&["a".into(), "b".into(), "a".into()]),
            vec!["a", "b", GLOBAL_CHANNEL]
        );
        assert_eq!(
            target_channels(&[GLOBAL_CHANNEL.into()]),
            vec![GLOBAL_CHANNEL]
        );
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}
