//! The observer feed: a lossy broadcast of structured bus events.
//!
//! External read-only consumers (the dashboard, a message tap) subscribe to
//! this feed; the broker never blocks on them. A receiver that lags simply
//! skips events — that is the contract, and why routing decisions must never
//! depend on this channel.

use minibus_core::Message;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffered event capacity per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Compact routing summary; bodies are deliberately not exported.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    /// Message kind token (`method_call`, `signal`, ...).
    pub kind: &'static str,
    /// Per-sender serial.
    pub serial: u32,
    /// Stamped sender, if past `Hello`.
    pub sender: Option<String>,
    /// Destination name, if unicast.
    pub destination: Option<String>,
    /// Interface, when present.
    pub interface: Option<String>,
    /// Member, when present.
    pub member: Option<String>,
}

impl From<&Message> for MessageSummary {
    fn from(message: &Message) -> Self {
        Self {
            kind: message.kind().token(),
            serial: message.serial,
            sender: message.sender.clone(),
            destination: message.destination.clone(),
            interface: message.interface.clone(),
            member: message.member.clone(),
        }
    }
}

/// One event on the feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A peer completed `Hello`.
    PeerUp {
        /// Assigned unique name.
        unique: String,
        /// Authenticated uid, if any.
        uid: Option<u32>,
    },
    /// A peer disconnected.
    PeerDown {
        /// Its unique name.
        unique: String,
    },
    /// A name changed owner. Empty strings mean "nobody".
    NameChanged {
        /// The name.
        name: String,
        /// Previous owner.
        old: String,
        /// New owner.
        new: String,
    },
    /// The router handled a message.
    MessageRouted {
        /// Routing summary.
        message: MessageSummary,
    },
    /// Policy denied an operation.
    PolicyDenied {
        /// What was attempted (`send`, `own`).
        action: &'static str,
        /// The denied peer's unique name.
        unique: String,
        /// Denial detail.
        detail: String,
    },
}

/// Handle for emitting events.
#[derive(Debug, Clone)]
pub struct ObserverFeed {
    tx: broadcast::Sender<BusEvent>,
}

impl ObserverFeed {
    /// Creates a feed with the given per-subscriber capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new consumer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. Never blocks; without subscribers this is a no-op.
    pub fn emit(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ObserverFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
