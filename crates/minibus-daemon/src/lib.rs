//! The minibus broker runtime.
//!
//! A D-Bus message broker: peers connect over a local stream socket, speak
//! the SASL-style handshake, and then exchange binary D-Bus messages routed
//! by a central dispatcher that enforces name ownership, match-rule
//! subscriptions, and capability policy.
//!
//! # Task topology
//!
//! ```text
//! server task ──accept──▶ peer task (one per connection)
//!                             │  RouterMsg (bounded mpsc)
//!                             ▼
//!                        router task ──▶ peer outbound queues
//!                             │
//!                             └──▶ observer feed (lossy broadcast)
//! ```
//!
//! Peers and the router share nothing but channels and identifiers; teardown
//! is an explicit `PeerDown` notification, never a dangling reference.

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod observer;
pub mod peer;
pub mod policy;
pub mod registry;
pub mod router;
pub mod server;
pub mod subscriptions;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use observer::{BusEvent, ObserverFeed};
pub use router::{Forwarder, NoForwarder, Router, RouterMsg};
pub use server::BrokerServer;
