//! Shared handle to one connected client.
//!
//! The handle is what the worker pool holds: an identity, the sending half of
//! the client's bounded outbound queue and the subscriptions it has taken out.
//! The socket itself is owned by the server's read and write loops.

use crate::channel::{ChannelId, SubscriptionId};
use eventual_protocol::CloudEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Default capacity of a session's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess_{:x}", self.0)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Items placed on a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Arc<CloudEvent>),
    /// Reply to a frame whose `type` was not understood.
    InvalidRequest,
}

/// Why a delivery did not land on the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("session is closed")]
    Closed,
    #[error("outbound queue is full")]
    Full,
    #[error("timed out waiting for outbound queue space")]
    Timeout,
}

struct Inner {
    id: SessionId,
    client_id: String,
    outbound: mpsc::Sender<Outbound>,
    state: AtomicU8,
    closed: Notify,
    subscriptions: Mutex<Vec<(ChannelId, SubscriptionId)>>,
}

/// Cloneable handle to a session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    /// Create a handle in `Connecting` state and the receiving end of its queue.
    #[must_use]
    pub fn new(client_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(Inner {
                id: SessionId::next(),
                client_id: client_id.into(),
                outbound: tx,
                state: AtomicU8::new(SessionState::Connecting as u8),
                closed: Notify::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Remote address of the client.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// `Connecting` → `Open`. Returns `false` if the session already began closing.
    pub fn mark_open(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True once closing has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= SessionState::Closing as u8
    }

    /// Begin closing. Exactly one caller ever receives `true`.
    pub fn close(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.inner.closed.notify_waiters();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// `Closing` → `Closed`, once the transport has been released.
    pub fn mark_closed(&self) {
        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Resolve once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Place an item on the outbound queue without waiting.
    ///
    /// # Errors
    ///
    /// `Closed` if the session is closing or its writer is gone, `Full` if the
    /// queue has no room.
    pub fn deliver(&self, item: Outbound) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.inner.outbound.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Place an item on the outbound queue, waiting up to `wait` for room.
    ///
    /// # Errors
    ///
    /// `Closed` if the session is gone, `Timeout` if no room appeared in time.
    pub async fn deliver_wait(&self, item: Outbound, wait: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match tokio::time::timeout(wait, self.inner.outbound.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Remember a subscription taken out on behalf of this session.
    pub fn record_subscription(&self, channel: impl Into<ChannelId>, id: SubscriptionId) {
        self.lock_subscriptions().push((channel.into(), id));
    }

    /// Forget and return the subscriptions held on any of `channels`.
    pub fn take_subscriptions(&self, channels: &[String]) -> Vec<SubscriptionId> {
        let mut subscriptions = self.lock_subscriptions();
        let mut taken = Vec::new();
        subscriptions.retain(|(channel, id)| {
            if channels.iter().any(|c| c == channel) {
                taken.push(id.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Forget and return every subscription.
    pub fn take_all_subscriptions(&self) -> Vec<SubscriptionId> {
        self.lock_subscriptions()
            .drain(..)
            .map(|(_, id)| id)
            .collect()
    }

    /// Snapshot of `(channel, subscription)` pairs.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(ChannelId, SubscriptionId)> {
        self.lock_subscriptions().clone()
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<(ChannelId, SubscriptionId)>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
