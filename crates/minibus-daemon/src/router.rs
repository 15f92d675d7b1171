//! The routing core.
//!
//! One task owns everything the peers share: the peer table, the name
//! registry, the subscription table, the policy store, and the bus driver.
//! Peers reach it through a bounded mailbox of typed [`RouterMsg`] requests;
//! no lock crosses a task boundary. Mailbox order is the ordering guarantee:
//! one sender's messages reach any destination in the order they were sent,
//! and a `NameOwnerChanged` signal is queued before any reply that could make
//! the change observable.
//!
//! Delivery to a peer is a `try_send` onto that peer's bounded outbound
//! queue. A full queue means the consumer is too slow to keep: the peer is
//! cancelled rather than allowed to stall the router (and with it, every
//! other peer on the bus).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use minibus_core::message::MessageKind;
use minibus_core::names::{BUS_NAME, BUS_PATH};
use minibus_core::{Message, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::driver;
use crate::error::name as error_name;
use crate::observer::{BusEvent, ObserverFeed};
use crate::peer::{PeerHandle, PeerId};
use crate::policy::{PolicyStore, SendDecision};
use crate::registry::{NameEvent, NameRegistry};
use crate::subscriptions::SubscriptionTable;

/// The process-wide monotonic counters: unique-name suffixes and serials for
/// bus-originated messages. This is the only genuinely global state in the
/// broker, and it is a pair of atomics.
#[derive(Debug, Default)]
pub struct BusCounters {
    next_unique: AtomicU64,
    next_serial: AtomicU32,
}

impl BusCounters {
    /// Creates counters starting at suffix 0 and serial 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_unique: AtomicU64::new(0),
            next_serial: AtomicU32::new(1),
        }
    }

    /// Next `:1.N` suffix.
    #[must_use]
    pub fn next_unique_suffix(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::Relaxed)
    }

    /// Next serial for a bus-originated message. Serial 0 is invalid on the
    /// wire, so the counter skips it on wraparound.
    #[must_use]
    pub fn next_serial(&self) -> u32 {
        let mut serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        if serial == 0 {
            serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        }
        serial
    }
}

/// Requests into the router task.
#[derive(Debug)]
pub enum RouterMsg {
    /// A peer finished its handshake and can receive messages.
    PeerUp {
        /// The new peer.
        id: PeerId,
        /// Delivery and teardown handle.
        handle: PeerHandle,
    },
    /// A peer's task is exiting; release everything keyed by it.
    PeerDown {
        /// The departing peer.
        id: PeerId,
    },
    /// A decoded inbound message to route.
    Route {
        /// Which peer sent it.
        from: PeerId,
        /// The message, descriptors attached.
        message: Message,
    },
}

/// Consulted when a method call addresses a name with no local owner.
/// A multi-node deployment plugs a real implementation in here; the default
/// declines everything and the caller gets `ServiceUnknown`.
pub trait Forwarder: Send {
    /// Returns `true` when the message was taken over for remote delivery.
    fn forward(&mut self, message: &Message) -> bool;
}

/// The default forwarder: every name is local.
#[derive(Debug, Default)]
pub struct NoForwarder;

impl Forwarder for NoForwarder {
    fn forward(&mut self, _message: &Message) -> bool {
        false
    }
}

/// Router-side state for one live peer.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    /// Delivery and teardown handle.
    pub(crate) handle: PeerHandle,
    /// Unique name, present once the peer said `Hello`.
    pub(crate) unique: Option<String>,
}

/// The routing core. Constructed once, then moved into its task via
/// [`Router::run`].
pub struct Router {
    rx: mpsc::Receiver<RouterMsg>,
    pub(crate) peers: HashMap<PeerId, PeerEntry>,
    pub(crate) registry: NameRegistry,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) policy: PolicyStore,
    pub(crate) counters: Arc<BusCounters>,
    pub(crate) observer: ObserverFeed,
    pub(crate) config: Arc<BrokerConfig>,
    forwarder: Box<dyn Forwarder>,
}

impl Router {
    /// Creates the router and the sender half of its mailbox.
    #[must_use]
    pub fn new(
        config: Arc<BrokerConfig>,
        observer: ObserverFeed,
        forwarder: Box<dyn Forwarder>,
    ) -> (mpsc::Sender<RouterMsg>, Self) {
        let (tx, rx) = mpsc::channel(config.router_queue);
        let counters = Arc::new(BusCounters::new());
        let router = Self {
            rx,
            peers: HashMap::new(),
            registry: NameRegistry::new(Arc::clone(&counters)),
            subscriptions: SubscriptionTable::new(),
            policy: PolicyStore::new(config.privileged_uid_ceiling),
            counters,
            observer,
            config,
            forwarder,
        };
        (tx, router)
    }

    /// Processes the mailbox until every sender is gone.
    pub async fn run(mut self) {
        info!("router started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                RouterMsg::PeerUp { id, handle } => self.handle_peer_up(id, handle),
                RouterMsg::PeerDown { id } => self.handle_peer_down(id),
                RouterMsg::Route { from, message } => self.handle_route(from, message),
            }
        }
        info!("router stopped");
    }

    fn handle_peer_up(&mut self, id: PeerId, handle: PeerHandle) {
        debug!(peer = %id, "peer registered with router");
        self.peers.insert(
            id,
            PeerEntry {
                handle,
                unique: None,
            },
        );
    }

    fn handle_peer_down(&mut self, id: PeerId) {
        let Some(entry) = self.peers.remove(&id) else {
            return;
        };
        let Some(unique) = entry.unique else {
            return; // never said Hello; nothing is keyed by it
        };

        let events = self.registry.peer_disconnected(id);
        self.subscriptions.peer_disconnected(id);
        self.policy.peer_disconnected(&unique);
        self.publish_name_events(events);
        self.observer.emit(BusEvent::PeerDown {
            unique: unique.clone(),
        });
        info!(peer = %id, %unique, "peer resources released");
    }

    /// The central dispatch: observer tap, sender stamp, policy gate, then
    /// unicast, bus-object, or signal fan-out.
    fn handle_route(&mut self, from: PeerId, mut message: Message) {
        let Some(entry) = self.peers.get(&from) else {
            return; // raced with teardown; descriptors drop with the message
        };

        let Some(unique) = entry.unique.clone() else {
            self.handle_pre_hello(from, &message);
            return;
        };

        // The broker, not the client, decides what the sender field says.
        message.sender = Some(unique.clone());

        self.observer.emit(BusEvent::MessageRouted {
            message: (&message).into(),
        });

        if let SendDecision::Deny { error_name, reason } =
            self.policy.check_send(&unique, &message)
        {
            debug!(peer = %from, %unique, %reason, "send denied");
            self.observer.emit(BusEvent::PolicyDenied {
                action: "send",
                unique: unique.clone(),
                detail: reason.clone(),
            });
            if message.kind() == MessageKind::MethodCall && !message.flags.no_reply_expected() {
                let reply = self
                    .bus_error(error_name, message.serial, &reason)
                    .with_destination(unique);
                self.deliver(from, Arc::new(reply));
            }
            return;
        }

        match message.kind() {
            MessageKind::Signal => self.route_signal(from, message),
            MessageKind::MethodCall => {
                let bus_destined = message
                    .destination
                    .as_deref()
                    .is_none_or(|dest| dest == BUS_NAME);
                if bus_destined {
                    if let Some(reply) = driver::dispatch(self, from, &message) {
                        self.deliver(from, Arc::new(reply));
                    }
                } else {
                    self.route_method_call(from, message);
                }
            },
            MessageKind::MethodReturn | MessageKind::Error => self.route_reply(from, message),
        }
    }

    /// Before `Hello`, the only admissible message is `Hello` itself.
    fn handle_pre_hello(&mut self, from: PeerId, message: &Message) {
        self.observer.emit(BusEvent::MessageRouted {
            message: message.into(),
        });
        if driver::is_hello(message) {
            if let Some(reply) = driver::dispatch(self, from, message) {
                self.deliver(from, Arc::new(reply));
            }
            return;
        }

        warn!(peer = %from, "message before Hello, disconnecting");
        if message.kind() == MessageKind::MethodCall && !message.flags.no_reply_expected() {
            let reply = self.bus_error(
                error_name::ACCESS_DENIED,
                message.serial,
                "client must call Hello before any other message",
            );
            self.deliver(from, Arc::new(reply));
        }
        if let Some(entry) = self.peers.get(&from) {
            entry.handle.cancel.cancel();
        }
    }

    fn route_method_call(&mut self, from: PeerId, message: Message) {
        let dest = message
            .destination
            .clone()
            .expect("bus-destined calls are handled earlier");

        if let Some(target) = self.registry.resolve(&dest) {
            let message = Arc::new(message);
            self.tap_unicast(&message, from, target);
            self.deliver(target, message);
            return;
        }

        if self.forwarder.forward(&message) {
            return;
        }

        if !message.flags.no_reply_expected() {
            let sender = message.sender.clone().unwrap_or_default();
            let reply = self
                .bus_error(
                    error_name::SERVICE_UNKNOWN,
                    message.serial,
                    &format!("the name {dest} has no owner"),
                )
                .with_destination(sender);
            self.deliver(from, Arc::new(reply));
        }
    }

    fn route_reply(&mut self, from: PeerId, message: Message) {
        let Some(dest) = message.destination.clone() else {
            debug!("dropping reply without destination");
            return;
        };
        if dest == BUS_NAME {
            return; // the bus correlates nothing
        }
        match self.registry.resolve(&dest) {
            Some(target) => {
                let message = Arc::new(message);
                self.tap_unicast(&message, from, target);
                self.deliver(target, message);
            },
            // The caller's timeout is the recovery path, never the router's.
            None => debug!(%dest, "dropping reply to vanished destination"),
        }
    }

    fn route_signal(&mut self, from: PeerId, message: Message) {
        if let Some(dest) = message.destination.clone() {
            if dest == BUS_NAME {
                return;
            }
            match self.registry.resolve(&dest) {
                Some(target) => {
                    let message = Arc::new(message);
                    self.tap_unicast(&message, from, target);
                    self.deliver(target, message);
                },
                None => debug!(%dest, "dropping unicast signal to unknown destination"),
            }
            return;
        }

        self.broadcast_signal(&Arc::new(message));
    }

    /// Fan-out for a broadcast signal: every peer with a matching rule, plus
    /// (when the compatibility fallback is enabled) peers that registered no
    /// rules at all.
    fn broadcast_signal(&self, message: &Arc<Message>) {
        let mut targets: HashSet<PeerId> = self
            .subscriptions
            .matching_peers(message.as_ref())
            .into_iter()
            .collect();

        if self.config.compat_broadcast {
            for (id, entry) in &self.peers {
                if entry.unique.is_some() && !self.subscriptions.has_rules(*id) {
                    targets.insert(*id);
                }
            }
        }

        for target in targets {
            self.deliver(target, Arc::clone(message));
        }
    }

    /// Delivers tap copies of a unicast message to authorized eavesdroppers.
    fn tap_unicast(&self, message: &Arc<Message>, sender: PeerId, receiver: PeerId) {
        for peer in self.subscriptions.eavesdroppers(message.as_ref()) {
            if peer == sender || peer == receiver {
                continue;
            }
            let Some(entry) = self.peers.get(&peer) else {
                continue;
            };
            let Some(unique) = entry.unique.as_deref() else {
                continue;
            };
            if self.policy.check_eavesdrop(unique, message.sender.as_deref()) {
                self.deliver(peer, Arc::clone(message));
            }
        }
    }

    /// Emits a bus-originated signal (notably `NameOwnerChanged`) with a
    /// dedicated bus serial, fanned out like any broadcast.
    pub(crate) fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) {
        let message = Message::signal(path, interface, member)
            .with_sender(BUS_NAME)
            .with_serial(self.counters.next_serial())
            .with_body(body);
        self.broadcast_signal(&Arc::new(message));
    }

    /// Publishes registry transitions: one `NameOwnerChanged` signal and one
    /// observer event per transition, in registry order.
    pub(crate) fn publish_name_events(&self, events: Vec<NameEvent>) {
        for event in events {
            self.observer.emit(BusEvent::NameChanged {
                name: event.name.clone(),
                old: event.old_owner.clone(),
                new: event.new_owner.clone(),
            });
            self.emit_signal(
                BUS_PATH,
                driver::BUS_INTERFACE,
                "NameOwnerChanged",
                vec![
                    Value::String(event.name),
                    Value::String(event.old_owner),
                    Value::String(event.new_owner),
                ],
            );
        }
    }

    /// Builds a bus-originated error reply; the caller stamps the
    /// destination.
    pub(crate) fn bus_error(
        &self,
        error_name: &'static str,
        reply_serial: u32,
        text: &str,
    ) -> Message {
        Message::error(error_name, reply_serial)
            .with_sender(BUS_NAME)
            .with_serial(self.counters.next_serial())
            .with_body_value(Value::String(text.to_owned()))
    }

    /// Enqueues a message for a peer. Overflow drops the slow consumer
    /// rather than stalling the router.
    pub(crate) fn deliver(&self, target: PeerId, message: Arc<Message>) {
        let Some(entry) = self.peers.get(&target) else {
            return; // undelivered descriptors close with the message
        };
        match entry.handle.outbound.try_send(message) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %target, "outbound queue overflow, dropping slow consumer");
                entry.handle.cancel.cancel();
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {},
        }
    }
}
