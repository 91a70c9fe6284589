//! Per-channel replay buffers for recently published events.
//!
//! A buffer lives while it is being written to: every enqueue pushes its
//! expiry `ttl` into the future. Independently, no event is kept longer than
//! `max_age`. Expired state is dropped lazily on access and by [`ReplayQueue::purge_expired`].

use crate::channel::ChannelId;
use dashmap::DashMap;
use eventual_protocol::CloudEvent;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Replay errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// No live buffer, or a buffer with nothing in it.
    #[error("no replayable events for channel {0}")]
    NotFound(ChannelId),
}

/// Replay configuration.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Sliding expiry of a whole buffer, refreshed on every enqueue.
    pub ttl: Duration,
    /// Hard upper bound on how long a single event is retained.
    pub max_age: Duration,
    /// How often the janitor sweeps expired buffers.
    pub purge_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(10 * 60),
            purge_interval: Duration::from_secs(10 * 60),
        }
    }
}

struct Stamped {
    event: Arc<CloudEvent>,
    enqueued_at: Instant,
}

struct Buffer {
    events: VecDeque<Stamped>,
    expires_at: Instant,
}

impl Buffer {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn evict_aged(&mut self, now: Instant, max_age: Duration) {
        while self
            .events
            .front()
            .is_some_and(|e| now.duration_since(e.enqueued_at) >= max_age)
        {
            self.events.pop_front();
        }
    }
}

/// A one-shot, ordered snapshot of a channel's buffer.
#[derive(Debug)]
pub struct ReplayIter {
    events: std::vec::IntoIter<Arc<CloudEvent>>,
}

impl Iterator for ReplayIter {
    type Item = Arc<CloudEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

impl ExactSizeIterator for ReplayIter {}

/// TTL-bounded replay buffers keyed by channel.
pub struct ReplayQueue {
    buffers: DashMap<ChannelId, Buffer>,
    config: ReplayConfig,
}

impl ReplayQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ReplayConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ReplayConfig) -> Self {
        Self {
            buffers: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Append `event` to the channel's buffer and refresh its expiry.
    pub fn enqueue(&self, channel: &str, event: Arc<CloudEvent>) {
        let now = Instant::now();
        let mut buffer = self
            .buffers
            .entry(channel.to_string())
            .or_insert_with(|| Buffer {
                events: VecDeque::new(),
                expires_at: now,
            });

        if buffer.is_expired(now) {
            buffer.events.clear();
        }
        buffer.evict_aged(now, self.config.max_age);
        buffer.events.push_back(Stamped {
            event,
            enqueued_at: now,
        });
        buffer.expires_at = now + self.config.ttl;

        trace!(channel = %channel, buffered = buffer.events.len(), "Enqueued for replay");
    }

    /// Take or peek the oldest retained event.
    ///
    /// With `consume`, the event is removed from the buffer.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotFound` if the channel has no live events.
    pub fn dequeue(&self, channel: &str, consume: bool) -> Result<Arc<CloudEvent>, ReplayError> {
        let now = Instant::now();
        let mut buffer = self.live_buffer(channel, now)?;

        let event = if consume {
            buffer.events.pop_front().map(|s| s.event)
        } else {
            buffer.events.front().map(|s| Arc::clone(&s.event))
        };
        event.ok_or_else(|| ReplayError::NotFound(channel.to_string()))
    }

    /// Snapshot every retained event in enqueue order.
    ///
    /// With `consume`, the buffer is emptied before the snapshot is returned.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotFound` if the channel has no live events.
    pub fn iter(&self, channel: &str, consume: bool) -> Result<ReplayIter, ReplayError> {
        let now = Instant::now();
        let mut buffer = self.live_buffer(channel, now)?;

        if buffer.events.is_empty() {
            return Err(ReplayError::NotFound(channel.to_string()));
        }

        let events: Vec<_> = if consume {
            buffer.events.drain(..).map(|s| s.event).collect()
        } else {
            buffer.events.iter().map(|s| Arc::clone(&s.event)).collect()
        };

        Ok(ReplayIter {
            events: events.into_iter(),
        })
    }

    /// Number of retained events for `channel` (expired state counts as zero).
    #[must_use]
    pub fn len(&self, channel: &str) -> usize {
        let now = Instant::now();
        self.buffers
            .get(channel)
            .filter(|b| !b.is_expired(now))
            .map(|b| {
                b.events
                    .iter()
                    .filter(|e| now.duration_since(e.enqueued_at) < self.config.max_age)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of buffers currently held, expired or not.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.buffers.len()
    }

    /// Drop expired buffers and aged-out events. Returns the number of buffers removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age;
        let before = self.buffers.len();

        self.buffers.retain(|_, buffer| {
            if buffer.is_expired(now) {
                return false;
            }
            buffer.evict_aged(now, max_age);
            !buffer.events.is_empty()
        });

        let removed = before.saturating_sub(self.buffers.len());
        if removed > 0 {
            debug!(removed, remaining = self.buffers.len(), "Purged replay buffers");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) on the configured interval until the task is dropped.
    pub async fn run_janitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.purge_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.purge_expired();
        }
    }

    fn live_buffer(
        &self,
        channel: &str,
        now: Instant,
    ) -> Result<dashmap::mapref::one::RefMut<'_, ChannelId, Buffer>, ReplayError> {
        let expired = match self.buffers.get_mut(channel) {
            Some(mut buffer) if !buffer.is_expired(now) => {
                buffer.evict_aged(now, self.config.max_age);
                return Ok(buffer);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.buffers.remove_if(channel, |_, b| b.is_expired(now));
            trace!(channel = %channel, "Replay buffer expired");
        }
        Err(ReplayError::NotFound(channel.to_string()))
    }
}

impl Default for ReplayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Arc<CloudEvent> {
        Arc::new(CloudEvent::new(id, "test", "test.event"))
    }

    fn ids(iter: ReplayIter) -> Vec<String> {
        iter.map(|e| e.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_iter_preserves_order() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("1"));
        queue.enqueue("a", event("2"));
        queue.enqueue("a", event("3"));

        assert_eq!(ids(queue.iter("a", false).unwrap()), vec!["1", "2", "3"]);
        // Non-destructive.
        assert_eq!(queue.len("a"), 3);
    }

    #[tokio::test]
    async fn test_iter_consume_drains() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("1"));
        queue.enqueue("a", event("2"));

        assert_eq!(ids(queue.iter("a", true).unwrap()), vec!["1", "2"]);
        assert_eq!(queue.iter("a", false).unwrap_err(), ReplayError::NotFound("a".into()));
    }

    #[tokio::test]
    async fn test_dequeue() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("1"));
        queue.enqueue("a", event("2"));

        assert_eq!(queue.dequeue("a", false).unwrap().id, "1");
        assert_eq!(queue.dequeue("a", true).unwrap().id, "1");
        assert_eq!(queue.dequeue("a", true).unwrap().id, "2");
        assert!(matches!(queue.dequeue("a", true), Err(ReplayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_channel() {
        let queue = ReplayQueue::new();
        assert!(matches!(queue.iter("nope", false), Err(ReplayError::NotFound(_))));
        assert!(matches!(queue.dequeue("nope", false), Err(ReplayError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_expires_after_idle_ttl() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("1"));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert_eq!(queue.len("a"), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(queue.iter("a", false), Err(ReplayError::NotFound(_))));
        assert_eq!(queue.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_slides_ttl() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("1"));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        queue.enqueue("a", event("2"));
        tokio::time::advance(Duration::from_secs(4 * 60)).await;

        // Eight minutes after the first enqueue, both events are still retained.
        assert_eq!(ids(queue.iter("a", false).unwrap()), vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_bounded_by_max_age() {
        let queue = ReplayQueue::new();
        queue.enqueue("a", event("old"));

        for i in 0..3 {
            tokio::time::advance(Duration::from_secs(4 * 60)).await;
            queue.enqueue("a", event(&format!("new-{i}")));
        }

        // "old" is twelve minutes old and has aged out despite the refreshes.
        assert_eq!(
            ids(queue.iter("a", false).unwrap()),
            vec!["new-0", "new-1", "new-2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let queue = ReplayQueue::new();
        queue.enqueue("stale", event("1"));
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        queue.enqueue("fresh", event("2"));

        assert_eq!(queue.purge_expired(), 1);
        assert_eq!(queue.channel_count(), 1);
        assert_eq!(queue.len("fresh"), 1);
    }
}
