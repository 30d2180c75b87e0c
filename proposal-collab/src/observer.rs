//! Local change observer.
//!
//! Listens to the document and forwards locally produced deltas to the
//! session's outbound path. Deltas that come from applying a peer's update
//! carry [`OriginTag::Remote`] and are dropped here, which is what stops
//! updates from bouncing between peers forever.

use tokio::sync::mpsc;

use crate::document::{CrdtDocument, DocumentError, OriginTag};

/// Document listener that feeds local deltas into an outbound channel.
pub struct LocalChangeObserver<S> {
    subscription: Option<S>,
}

impl<S: Send + 'static> LocalChangeObserver<S> {
    /// Install the listener on `document`.
    pub fn install<D>(document: &D, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Result<Self, DocumentError>
    where
        D: CrdtDocument<Subscription = S>,
    {
        let subscription = document.observe_updates(Box::new(move |delta, origin| {
            if origin == OriginTag::Remote {
                log::trace!("Suppressing echo of remote delta ({} bytes)", delta.len());
                return;
            }
            if outbound.send(delta.to_vec()).is_err() {
                log::debug!("Dropping local delta: session outbound path closed");
            }
        }))?;
        Ok(Self {
            subscription: Some(subscription),
        })
    }

    /// Remove the listener. Returns `false` if it was already removed.
    pub fn detach(&mut self) -> bool {
        self.subscription.take().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }
}
