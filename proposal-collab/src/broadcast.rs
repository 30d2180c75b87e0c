//! Channel fan-out with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers of a
//! channel. Each subscriber gets an independent receiver that buffers up to
//! `capacity` envelopes; slow subscribers lag and lose the oldest ones.
//!
//! Shared by the in-process [`crate::transport::MemoryHub`] and the
//! WebSocket [`crate::relay::RelayServer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::ChannelMessage;

/// A publication tagged with its sender so receivers can skip their own.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: Uuid,
    pub message: ChannelMessage,
}

/// Fan-out group for a single channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    subscribers: AtomicUsize,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the per-subscriber buffer before lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: AtomicUsize::new(0),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a subscriber and hand back its receiver.
    pub fn join(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        self.sender.subscribe()
    }

    /// Unregister a subscriber. Saturates at zero.
    pub fn leave(&self) {
        let _ = self
            .subscribers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Send to every receiver (the sender's own included; filtering is the
    /// receiver's job). Returns the number of receivers reached.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A subscriber's place in a channel group.
pub struct Membership {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

/// Maps channel names to broadcast groups so traffic stays isolated per
/// channel.
pub struct ChannelRegistry {
    groups: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join `channel`, creating its group on first use. Returns `None` if
    /// the group already has `max_subscribers` members.
    ///
    /// The limit check and the join happen under the write lock, so two
    /// joiners cannot both take the last slot and `remove_if_empty` never
    /// drops a group that just gained a member.
    pub async fn join(&self, channel: &str, max_subscribers: usize) -> Option<Membership> {
        let mut groups = self.groups.write().await;
        let full = match groups.get(channel) {
            Some(group) => group.subscriber_count() >= max_subscribers,
            None => max_subscribers == 0,
        };
        if full {
            return None;
        }
        let group = groups
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let receiver = group.join();
        Some(Membership { group, receiver })
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(channel).cloned()
    }

    /// Remove the group for `channel` if nobody is subscribed.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut groups = self.groups.write().await;
        let empty = groups
            .get(channel)
            .is_some_and(|group| group.subscriber_count() == 0);
        if empty {
            groups.remove(channel);
        }
        empty
    }

    pub async fn channel_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }
}
