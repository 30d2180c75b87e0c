//! In-process pub/sub hub.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryHub`] shares its
//! channels, which makes multi-participant sessions possible inside one
//! process. The hub can be told to become unreachable or to reject specific
//! channels so failure paths can be exercised without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Inbound, PubSubTransport, TransportError, INBOUND_CAPACITY};
use crate::broadcast::{ChannelRegistry, Envelope, Membership};
use crate::channel::ChannelId;
use crate::protocol::ChannelMessage;

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_published: u64,
    pub active_channels: usize,
}

/// Shared in-memory backend.
pub struct MemoryHub {
    registry: ChannelRegistry,
    reachable: AtomicBool,
    rejected: RwLock<HashSet<String>>,
    messages_published: AtomicU64,
}

impl MemoryHub {
    /// `capacity` is the per-subscriber buffer for each channel.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: ChannelRegistry::new(capacity),
            reachable: AtomicBool::new(true),
            rejected: RwLock::new(HashSet::new()),
            messages_published: AtomicU64::new(0),
        })
    }

    /// A new client with its own identity.
    pub fn client(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            client_id: Uuid::new_v4(),
            hub: self.clone(),
            connected: AtomicBool::new(false),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate the backend going down (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Refuse future subscriptions to `channel`.
    pub async fn reject_channel(&self, channel: &ChannelId) {
        self.rejected.write().await.insert(channel.to_string());
    }

    pub async fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.registry
            .get(channel.as_str())
            .await
            .map_or(0, |group| group.subscriber_count())
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            active_channels: self.registry.channel_count().await,
        }
    }
}

/// One participant's connection to a [`MemoryHub`].
pub struct MemoryTransport {
    client_id: Uuid,
    hub: Arc<MemoryHub>,
    connected: AtomicBool,
    /// channel → task pumping the broadcast receiver into the inbound queue
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Drop the connection as if the network failed: every subscription's
    /// inbound stream closes.
    pub async fn sever(&self) {
        self.connected.store(false, Ordering::Release);
        let pumps: Vec<(String, JoinHandle<()>)> = self.pumps.lock().await.drain().collect();
        for (channel, pump) in pumps {
            pump.abort();
            self.release(&channel).await;
        }
        log::info!("Memory client {} severed", self.client_id);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if !self.hub.is_reachable() {
            return Err(TransportError::Unreachable("memory hub offline".into()));
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn release(&self, channel: &str) {
        if let Some(group) = self.hub.registry.get(channel).await {
            group.leave();
        }
        self.hub.registry.remove_if_empty(channel).await;
    }

    /// Forward a channel's broadcasts to one inbound stream. A lagging
    /// subscriber has lost messages, so its stream is closed rather than
    /// resumed with a gap.
    fn spawn_pump(
        &self,
        mut rx: broadcast::Receiver<Arc<Envelope>>,
        channel: String,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> JoinHandle<()> {
        let own_id = self.client_id;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.sender == own_id {
                            continue;
                        }
                        if tx.send(envelope.message.clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!(
                            "Subscriber {own_id} on {channel} lagged by {n} messages, closing its stream"
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.hub.is_reachable() {
            return Err(TransportError::Unreachable("memory hub offline".into()));
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            log::debug!("Memory client {} connected", self.client_id);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<Inbound, TransportError> {
        self.ensure_connected()?;
        if self.hub.rejected.read().await.contains(channel.as_str()) {
            return Err(TransportError::Rejected {
                channel: channel.to_string(),
                reason: "channel not authorized".into(),
            });
        }

        let Some(Membership { group, receiver }) =
            self.hub.registry.join(channel.as_str(), usize::MAX).await
        else {
            return Err(TransportError::Rejected {
                channel: channel.to_string(),
                reason: "channel is full".into(),
            });
        };
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let pump = self.spawn_pump(receiver, channel.to_string(), tx);

        let previous = self.pumps.lock().await.insert(channel.to_string(), pump);
        if let Some(previous) = previous {
            previous.abort();
            group.leave();
        }
        Ok(rx)
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.hub.messages_published.fetch_add(1, Ordering::Relaxed);
        let reached = match self.hub.registry.get(channel.as_str()).await {
            Some(group) => group.broadcast(Envelope {
                sender: self.client_id,
                message: ChannelMessage::new(event, payload),
            }),
            None => 0,
        };
        log::debug!("Published {event} on {channel} to {reached} receivers");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let pump = self.pumps.lock().await.remove(channel.as_str());
        if let Some(pump) = pump {
            pump.abort();
            self.release(channel.as_str()).await;
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
    }
}
