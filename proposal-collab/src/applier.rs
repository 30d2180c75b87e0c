//! Remote update applier.
//!
//! Turns inbound channel messages back into binary deltas and merges them
//! into the local document under [`OriginTag::Remote`]. Malformed messages
//! are logged and dropped; they never reach the document.
//!
//! Duplicate delivery is left to the CRDT: re-applying a delta it already
//! integrated is a no-op there.

use std::sync::Arc;

use crate::document::{CrdtDocument, DocumentError, OriginTag};
use crate::protocol::{decode_update, ChannelMessage, ProtocolError};

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Decoded and merged. Carries the decoded delta.
    Applied(Vec<u8>),
    /// Not an update message; left for other consumers of the channel.
    Ignored,
    /// Payload missing or not decodable.
    Malformed(ProtocolError),
    /// Decoded, but the document refused the bytes.
    Rejected(DocumentError),
}

pub struct RemoteUpdateApplier<D> {
    document: Arc<D>,
}

impl<D: CrdtDocument> RemoteUpdateApplier<D> {
    pub fn new(document: Arc<D>) -> Self {
        Self { document }
    }

    /// Decode `message` and merge it into the document.
    pub fn apply(&self, message: &ChannelMessage) -> ApplyOutcome {
        if !message.is_update() {
            log::debug!("Ignoring channel message of type {:?}", message.event);
            return ApplyOutcome::Ignored;
        }

        let delta = match decode_update(&message.payload) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Dropping malformed update message: {e}");
                return ApplyOutcome::Malformed(e);
            }
        };

        match self.document.apply_update(&delta, OriginTag::Remote) {
            Ok(()) => ApplyOutcome::Applied(delta),
            Err(e) => {
                log::warn!("Dropping update the document could not apply: {e}");
                ApplyOutcome::Rejected(e)
            }
        }
    }
}

impl<D> Clone for RemoteUpdateApplier<D> {
    fn clone(&self) -> Self {
        Self {
            document: self.document.clone(),
        }
    }
}
