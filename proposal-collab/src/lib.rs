//! # proposal-collab: real-time sync provider for proposal documents
//!
//! Binds a shared CRDT document to a named pub/sub channel so every
//! participant's edits reach every other participant and all replicas
//! converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  y-update   ┌──────────────┐  y-update   ┌──────────────────┐
//! │ SessionTransport │ ──────────► │ PubSubTrans- │ ──────────► │ SessionTransport │
//! │ (participant A)  │ ◄────────── │ port         │ ◄────────── │ (participant B)  │
//! └────────┬─────────┘             └──────┬───────┘             └────────┬─────────┘
//!          │                              │                              │
//!          ▼                     MemoryHub │ RelayServer                  ▼
//! ┌──────────────────┐                    │                     ┌──────────────────┐
//! │ SharedDocument   │            ChannelRegistry               │ SharedDocument   │
//! │ (Yrs Doc)        │            (BroadcastGroup per channel)  │ (Yrs Doc)        │
//! └──────────────────┘                                          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: one document ↔ one channel, lifecycle and status
//! - [`observer`]: forwards local deltas, suppresses echoes of remote ones
//! - [`applier`]: decodes inbound messages and merges them
//! - [`queue`]: ordered buffer of unsent deltas
//! - [`protocol`]: `{ "update": "<base64>" }` payloads and relay frames
//! - [`transport`]: the pub/sub boundary plus in-memory and WebSocket clients
//! - [`relay`]: WebSocket fan-out server
//! - [`broadcast`]: per-channel fan-out shared by the hub and the relay

pub mod applier;
pub mod broadcast;
pub mod channel;
pub mod document;
pub mod observer;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod session;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use applier::{ApplyOutcome, RemoteUpdateApplier};
pub use broadcast::{BroadcastGroup, ChannelRegistry, Envelope, Membership};
pub use channel::{ChannelError, ChannelId};
pub use document::{CrdtDocument, DocumentError, OriginTag, SharedDocument, UpdateCallback};
pub use observer::LocalChangeObserver;
pub use protocol::{
    decode_update, encode_update, ChannelMessage, ProtocolError, RelayFrame, UPDATE_EVENT,
};
pub use queue::OutboundQueue;
pub use relay::{ConfigError, RelayConfig, RelayError, RelayServer, RelayStats};
pub use session::{SessionConfig, SessionError, SessionTransport};
pub use status::{ConnectionStatus, StatusEmitter};
pub use transport::{
    HubStats, Inbound, MemoryHub, MemoryTransport, PubSubTransport, TransportError, WsTransport,
};
