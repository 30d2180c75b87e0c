//! Connection status reporting.
//!
//! The current value is always readable; transitions are fanned out to any
//! number of observers. Observers only see transitions that happen after
//! they subscribe.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

/// Buffered transitions per observer before it starts lagging.
const STATUS_CAPACITY: usize = 32;

/// State of a session's link to the pub/sub transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cheaply cloneable status cell with transition broadcast.
#[derive(Clone)]
pub struct StatusEmitter {
    current: Arc<watch::Sender<ConnectionStatus>>,
    transitions: broadcast::Sender<ConnectionStatus>,
}

impl StatusEmitter {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (current, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            current: Arc::new(current),
            transitions,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.current.borrow()
    }

    /// Move to `next`. Returns `false` and emits nothing when unchanged.
    pub fn set(&self, next: ConnectionStatus) -> bool {
        let previous = self.current.send_replace(next);
        if previous == next {
            return false;
        }
        log::debug!("Connection status {previous} -> {next}");
        // No receivers is fine: nobody is watching right now.
        let _ = self.transitions.send(next);
        true
    }

    /// Move to `next` only if the current value is `expected`.
    pub fn transition(&self, expected: ConnectionStatus, next: ConnectionStatus) -> bool {
        let mut changed = false;
        self.current.send_if_modified(|status| {
            if *status == expected && expected != next {
                *status = next;
                changed = true;
            }
            changed
        });
        if changed {
            log::debug!("Connection status {expected} -> {next}");
            let _ = self.transitions.send(next);
        }
        changed
    }

    /// Observe future transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.transitions.subscribe()
    }
}

impl Default for StatusEmitter {
    fn default() -> Self {
        Self::new(ConnectionStatus::Disconnected)
    }
}

impl fmt::Debug for StatusEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusEmitter")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
