//! Capability-based access policy.
//!
//! Policy is a multimap from a peer's unique name to a set of [`Capability`]
//! grants. Defaults are installed from the peer's authenticated credentials
//! when it says `Hello`; everything is torn down with the peer.
//!
//! Signals are deliberately exempt from send checks, and replies (method
//! returns and errors) are always allowed, as is anything addressed to the
//! bus itself. Only method calls to other peers go through the grant walk.

use minibus_core::message::MessageKind;
use minibus_core::names::BUS_NAME;
use minibus_core::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::name as error_name;

/// One tagged grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "grant", rename_all = "snake_case")]
pub enum Capability {
    /// Everything, everywhere.
    Superuser,
    /// Send method calls to any destination.
    SendAny,
    /// Send method calls to one destination name.
    SendTo {
        /// Destination bus name.
        dest: String,
    },
    /// Own any well-known name.
    OwnAny,
    /// Own one specific well-known name.
    Own {
        /// The grantable name.
        name: String,
    },
    /// Call one interface (optionally one member) on one destination.
    Call {
        /// Destination bus name.
        dest: String,
        /// Interface name.
        interface: String,
        /// Member restriction; `None` covers the whole interface.
        member: Option<String>,
    },
    /// Receive unicast traffic from one sender while tapping.
    ReceiveFrom {
        /// Sender bus name.
        sender: String,
    },
    /// Observe unicast traffic addressed to other peers.
    Eavesdrop,
}

/// Outcome of a send check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Deliver the message.
    Allow,
    /// Refuse, with the error name to put on the wire.
    Deny {
        /// D-Bus error name for the synthetic reply.
        error_name: &'static str,
        /// Human-readable reason for the audit event.
        reason: String,
    },
}

impl SendDecision {
    /// `true` for [`SendDecision::Allow`].
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Grants per unique name, plus the connect-time default rules.
#[derive(Debug)]
pub struct PolicyStore {
    grants: HashMap<String, HashSet<Capability>>,
    /// Uids below this (other than root) get the permissive default set.
    privileged_uid_ceiling: u32,
}

impl PolicyStore {
    /// Creates a store with the given privileged-uid ceiling.
    #[must_use]
    pub fn new(privileged_uid_ceiling: u32) -> Self {
        Self {
            grants: HashMap::new(),
            privileged_uid_ceiling,
        }
    }

    /// Installs the connect-time default grants for a peer.
    ///
    /// root gets `Superuser`; system users below the ceiling get
    /// `OwnAny` + `SendAny`; everyone else (including anonymous peers) may
    /// only talk to the bus itself.
    pub fn install_defaults(&mut self, unique: &str, uid: Option<u32>) {
        let set = self.grants.entry(unique.to_owned()).or_default();
        match uid {
            Some(0) => {
                set.insert(Capability::Superuser);
            },
            Some(uid) if uid < self.privileged_uid_ceiling => {
                set.insert(Capability::OwnAny);
                set.insert(Capability::SendAny);
            },
            _ => {
                set.insert(Capability::SendTo {
                    dest: BUS_NAME.to_owned(),
                });
            },
        }
    }

    /// Adds a grant to a peer.
    pub fn grant(&mut self, unique: &str, capability: Capability) {
        self.grants
            .entry(unique.to_owned())
            .or_default()
            .insert(capability);
    }

    /// Destroys every grant held by a peer.
    pub fn peer_disconnected(&mut self, unique: &str) {
        self.grants.remove(unique);
    }

    /// Gate on every send. See the module docs for the exemptions.
    #[must_use]
    pub fn check_send(&self, unique: &str, message: &Message) -> SendDecision {
        match message.kind() {
            // Replies always flow; correlation is the caller's business.
            MessageKind::MethodReturn | MessageKind::Error => return SendDecision::Allow,
            // Signals are not subject to send policy.
            MessageKind::Signal => return SendDecision::Allow,
            MessageKind::MethodCall => {},
        }

        let Some(dest) = message.destination.as_deref() else {
            return SendDecision::Allow;
        };
        if dest == BUS_NAME {
            return SendDecision::Allow;
        }

        let allowed = self.grants.get(unique).is_some_and(|grants| {
            grants.iter().any(|grant| match grant {
                Capability::Superuser | Capability::SendAny => true,
                Capability::SendTo { dest: d } => d == dest,
                Capability::Call {
                    dest: d,
                    interface,
                    member,
                } => {
                    d == dest
                        && message.interface.as_deref() == Some(interface.as_str())
                        && member
                            .as_deref()
                            .is_none_or(|m| message.member.as_deref() == Some(m))
                },
                _ => false,
            })
        });

        if allowed {
            SendDecision::Allow
        } else {
            SendDecision::Deny {
                error_name: error_name::ACCESS_DENIED,
                reason: format!(
                    "{} may not call {}.{} on {}",
                    unique,
                    message.interface.as_deref().unwrap_or("<none>"),
                    message.member.as_deref().unwrap_or("<none>"),
                    dest,
                ),
            }
        }
    }

    /// Gate on `RequestName`.
    #[must_use]
    pub fn check_own(&self, unique: &str, name: &str) -> bool {
        self.grants.get(unique).is_some_and(|grants| {
            grants.iter().any(|grant| match grant {
                Capability::Superuser | Capability::OwnAny => true,
                Capability::Own { name: n } => n == name,
                _ => false,
            })
        })
    }

    /// Gate on unicast tap delivery. `sender` is the stamped sender of the
    /// message being observed; a scoped `ReceiveFrom` grant admits exactly
    /// that sender's traffic.
    #[must_use]
    pub fn check_eavesdrop(&self, unique: &str, sender: Option<&str>) -> bool {
        self.grants.get(unique).is_some_and(|grants| {
            grants.iter().any(|grant| match grant {
                Capability::Superuser | Capability::Eavesdrop => true,
                Capability::ReceiveFrom { sender: s } => sender == Some(s.as_str()),
                _ => false,
            })
        })
    }
}
