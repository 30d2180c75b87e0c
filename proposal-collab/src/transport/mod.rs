//! Publish/subscribe transport boundary.
//!
//! A session only needs four things from the backend: a connection
//! handshake, channel subscription, publication, and unsubscription.
//! Authorization is the transport's business; a session assumes its client
//! is already allowed on the channel.
//!
//! Transports never deliver a client's own publications back to it.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::ChannelId;
use crate::protocol::{ChannelMessage, ProtocolError};

pub use memory::{HubStats, MemoryHub, MemoryTransport};
pub use ws::WsTransport;

/// Buffered inbound messages per subscription.
pub const INBOUND_CAPACITY: usize = 256;

/// Inbound messages for one subscription. Closes when the subscription is
/// lost or removed.
pub type Inbound = mpsc::Receiver<ChannelMessage>;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("subscription to {channel} rejected: {reason}")]
    Rejected { channel: String, reason: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The backend publish/subscribe client.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Establish the backend connection. Calling it while connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to `channel`. Replaces an existing subscription to the same
    /// channel held by this client.
    async fn subscribe(&self, channel: &ChannelId) -> Result<Inbound, TransportError>;

    /// Publish `payload` under `event` to every other subscriber of `channel`.
    async fn publish(
        &self,
        channel: &ChannelId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError>;

    /// Drop the subscription to `channel`. Unknown channels are ignored.
    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError>;
}
