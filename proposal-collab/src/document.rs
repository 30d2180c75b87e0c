//! CRDT document boundary.
//!
//! The session layer never merges anything itself. It talks to the CRDT
//! engine through [`CrdtDocument`]: observe updates, apply updates, encode
//! full state. [`SharedDocument`] adapts a Yrs `Doc` to that interface.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::channel::ChannelId;

/// Name of the Y.Text holding the proposal body.
const BODY_TEXT_NAME: &str = "body";

/// Transaction origin attached to updates applied from the channel.
const REMOTE_ORIGIN: &str = "proposal-collab:remote";

/// Where a document mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginTag {
    /// An edit made in this process.
    Local,
    /// The result of applying a delta received from a peer.
    Remote,
}

/// Callback invoked for every committed update.
pub type UpdateCallback = Box<dyn Fn(&[u8], OriginTag) + Send + Sync + 'static>;

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("update could not be decoded: {0}")]
    InvalidUpdate(String),
    #[error("update could not be integrated: {0}")]
    ApplyFailed(String),
    #[error("document is busy: {0}")]
    Busy(String),
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: u32, len: u32 },
}

/// Capabilities the session layer needs from a CRDT document.
pub trait CrdtDocument: Send + Sync + 'static {
    /// Listener handle. Dropping it removes the listener.
    type Subscription: Send + 'static;

    /// Register `callback` for every committed update, local or applied.
    fn observe_updates(&self, callback: UpdateCallback) -> Result<Self::Subscription, DocumentError>;

    /// Merge a delta. Re-applying an already integrated delta is a no-op.
    fn apply_update(&self, update: &[u8], origin: OriginTag) -> Result<(), DocumentError>;

    /// Whole document state encoded as one update.
    fn encode_state(&self) -> Vec<u8>;

    /// Mark the document as bound to a session. Returns `false` if another
    /// session already holds it.
    fn claim_session(&self) -> bool;

    /// Release a claim taken with [`CrdtDocument::claim_session`].
    fn release_session(&self);
}

/// A proposal document backed by Yrs, scoped to one channel.
pub struct SharedDocument {
    channel: ChannelId,
    doc: Doc,
    body: TextRef,
    bound: AtomicBool,
}

impl SharedDocument {
    pub fn new(channel: ChannelId) -> Self {
        let doc = Doc::new();
        let body = doc.get_or_insert_text(BODY_TEXT_NAME);
        Self {
            channel,
            doc,
            body,
            bound: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Full body text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.body.get_string(&txn)
    }

    /// Body length in Yrs index units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.body.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert text as a local edit.
    pub fn insert(&self, index: u32, chunk: &str) -> Result<(), DocumentError> {
        let mut txn = self.doc.transact_mut();
        let len = self.body.len(&txn);
        if index > len {
            return Err(DocumentError::OutOfBounds { index, len });
        }
        self.body.insert(&mut txn, index, chunk);
        Ok(())
    }

    /// Append text as a local edit.
    pub fn push(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.body.push(&mut txn, chunk);
    }

    /// Remove `count` units starting at `index` as a local edit.
    pub fn remove_range(&self, index: u32, count: u32) -> Result<(), DocumentError> {
        let mut txn = self.doc.transact_mut();
        let len = self.body.len(&txn);
        if index.saturating_add(count) > len {
            return Err(DocumentError::OutOfBounds {
                index: index.saturating_add(count),
                len,
            });
        }
        self.body.remove_range(&mut txn, index, count);
        Ok(())
    }
}

impl CrdtDocument for SharedDocument {
    type Subscription = yrs::Subscription;

    fn observe_updates(&self, callback: UpdateCallback) -> Result<Self::Subscription, DocumentError> {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = if txn.origin() == Some(&remote) {
                    OriginTag::Remote
                } else {
                    OriginTag::Local
                };
                callback(&event.update, origin);
            })
            .map_err(|e| DocumentError::Busy(e.to_string()))
    }

    fn apply_update(&self, update: &[u8], origin: OriginTag) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let mut txn = match origin {
            OriginTag::Remote => self.doc.transact_mut_with(REMOTE_ORIGIN),
            OriginTag::Local => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn claim_session(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_session(&self) {
        self.bound.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("channel", &self.channel)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
