//! WebSocket pub/sub relay.
//!
//! ```text
//! Client A ──┐                                  ┌──► Client B
//!            ├── Publish ── ChannelRegistry ────┤
//! Client C ──┘        (one BroadcastGroup       └──► Client C
//!                      per channel)
//! ```
//!
//! The relay never interprets update payloads. It fans each publication out
//! to every other subscriber of the channel and nothing more: no document
//! state, no persistence, no history for late joiners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ChannelRegistry, Envelope, Membership};
use crate::channel::ChannelId;
use crate::protocol::{parse_payload, ChannelMessage, ProtocolError, RelayFrame};

pub const ENV_BIND_ADDR: &str = "PROPOSAL_RELAY_ADDR";
pub const ENV_MAX_SUBSCRIBERS: &str = "PROPOSAL_RELAY_MAX_SUBSCRIBERS";
pub const ENV_BROADCAST_CAPACITY: &str = "PROPOSAL_RELAY_BROADCAST_CAPACITY";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per channel
    pub max_subscribers_per_channel: usize,
    /// Per-subscriber buffer before a slow client starts losing messages
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_channel: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Invalid relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl RelayConfig {
    /// Defaults overridden by `PROPOSAL_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            if addr.trim().is_empty() {
                return Err(ConfigError {
                    key: ENV_BIND_ADDR,
                    value: addr,
                    reason: "must not be empty".into(),
                });
            }
            config.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_MAX_SUBSCRIBERS) {
            config.max_subscribers_per_channel = parse_positive(ENV_MAX_SUBSCRIBERS, value)?;
        }
        if let Some(value) = lookup(ENV_BROADCAST_CAPACITY) {
            config.broadcast_capacity = parse_positive(ENV_BROADCAST_CAPACITY, value)?;
        }
        Ok(config)
    }
}

fn parse_positive(key: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError {
            key,
            value,
            reason: "must be greater than zero".into(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_relayed: u64,
    pub rejected_subscriptions: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_relayed: AtomicU64,
    rejected_subscriptions: AtomicU64,
}

struct Shared {
    config: RelayConfig,
    registry: ChannelRegistry,
    counters: Counters,
}

/// Per-connection subscriptions: channel → pump task.
type Pumps = HashMap<String, JoinHandle<()>>;

impl Shared {
    /// Handle one decoded frame. Returns the direct reply, if any.
    async fn handle_frame(
        &self,
        conn_id: Uuid,
        frame: RelayFrame,
        pumps: &mut Pumps,
        deliver: &mpsc::Sender<RelayFrame>,
    ) -> Option<RelayFrame> {
        match frame {
            RelayFrame::Subscribe { channel } => {
                Some(self.subscribe(conn_id, channel, pumps, deliver).await)
            }
            RelayFrame::Unsubscribe { channel } => {
                if let Some(pump) = pumps.remove(&channel) {
                    pump.abort();
                    self.leave(&channel).await;
                    log::debug!("Connection {conn_id} left {channel}");
                }
                None
            }
            RelayFrame::Publish {
                channel,
                event,
                payload,
            } => {
                let payload = match parse_payload(&payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Dropping {event} from {conn_id} on {channel}: {e}");
                        return None;
                    }
                };
                self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);
                if let Some(group) = self.registry.get(&channel).await {
                    let reached = group.broadcast(Envelope {
                        sender: conn_id,
                        message: ChannelMessage::new(event, payload),
                    });
                    log::trace!("Relayed on {channel} to {reached} receivers");
                }
                None
            }
            RelayFrame::Ping => Some(RelayFrame::Pong),
            other => {
                log::debug!("Ignoring unexpected frame from {conn_id}: {other:?}");
                None
            }
        }
    }

    async fn subscribe(
        &self,
        conn_id: Uuid,
        channel: String,
        pumps: &mut Pumps,
        deliver: &mpsc::Sender<RelayFrame>,
    ) -> RelayFrame {
        if let Err(e) = ChannelId::parse(channel.as_str()) {
            return self.reject(channel, e.to_string());
        }
        if pumps.contains_key(&channel) {
            return RelayFrame::Subscribed { channel };
        }

        let limit = self.config.max_subscribers_per_channel;
        let Some(Membership { group, receiver }) = self.registry.join(&channel, limit).await else {
            return self.reject(channel, "channel is full".into());
        };

        let pump = spawn_pump(receiver, conn_id, channel.clone(), deliver.clone());
        pumps.insert(channel.clone(), pump);
        log::info!(
            "Connection {conn_id} subscribed to {channel} ({} subscribers)",
            group.subscriber_count()
        );
        RelayFrame::Subscribed { channel }
    }

    fn reject(&self, channel: String, reason: String) -> RelayFrame {
        self.counters
            .rejected_subscriptions
            .fetch_add(1, Ordering::Relaxed);
        log::warn!("Rejected subscription to {channel:?}: {reason}");
        RelayFrame::Rejected { channel, reason }
    }

    async fn leave(&self, channel: &str) {
        if let Some(group) = self.registry.get(channel).await {
            group.leave();
        }
        if self.registry.remove_if_empty(channel).await {
            log::debug!("Channel {channel} removed (empty)");
        }
    }
}

/// Forward a channel's broadcasts to one connection, skipping its own.
/// A lagging connection has lost messages; it is told the subscription was
/// dropped instead of being fed a stream with a gap.
fn spawn_pump(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    conn_id: Uuid,
    channel: String,
    deliver: mpsc::Sender<RelayFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if envelope.sender == conn_id {
                        continue;
                    }
                    let frame = RelayFrame::Message {
                        channel: channel.clone(),
                        event: envelope.message.event.clone(),
                        payload: envelope.message.payload.to_string(),
                    };
                    if deliver.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {conn_id} lagged by {n} messages on {channel}, dropping it");
                    let dropped = RelayFrame::Dropped {
                        channel,
                        reason: format!("lagged by {n} messages"),
                    };
                    if deliver.send(dropped).await.is_err() {
                        log::debug!("Connection {conn_id} gone before drop notice");
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = ChannelRegistry::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let counters = &self.shared.counters;
        RelayStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            messages_relayed: counters.messages_relayed.load(Ordering::Relaxed),
            rejected_subscriptions: counters.rejected_subscriptions.load(Ordering::Relaxed),
            active_channels: self.shared.registry.channel_count().await,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn_id = Uuid::new_v4();
    log::info!("WebSocket connection {conn_id} established from {addr}");

    shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let (deliver_tx, mut deliver_rx) =
        mpsc::channel::<RelayFrame>(shared.config.broadcast_capacity);
    let mut pumps = Pumps::new();

    let result: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(frame) => {
                                let reply = shared
                                    .handle_frame(conn_id, frame, &mut pumps, &deliver_tx)
                                    .await;
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn_id} closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },
                Some(frame) = deliver_rx.recv() => {
                    if let RelayFrame::Dropped { channel, .. } = &frame {
                        if let Some(pump) = pumps.remove(channel) {
                            pump.abort();
                            shared.leave(channel).await;
                        }
                    }
                    ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    for (channel, pump) in pumps.drain() {
        pump.abort();
        shared.leave(&channel).await;
    }
    shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}
