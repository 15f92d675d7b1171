//! The name registry.
//!
//! Maps well-known names to their current owner plus a queue of waiters, and
//! unique names to connections. Every ownership transition is reported as a
//! [`NameEvent`] which the router turns into `NameOwnerChanged` signals and
//! observer events.
//!
//! # Invariants
//!
//! - At most one current owner per well-known name.
//! - Unique names never appear in waiter queues.
//! - Removing the current owner promotes the queue head or deletes the entry.
//! - Reverse indexes (peer → owned names, peer → queued names) keep
//!   disconnect teardown proportional to the peer's own footprint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::peer::PeerId;
use crate::router::BusCounters;

/// `RequestName` flag: the owner consents to being replaced.
pub const FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
/// `RequestName` flag: take the name from a consenting owner.
pub const FLAG_REPLACE_EXISTING: u32 = 0x2;
/// `RequestName` flag: fail instead of queueing.
pub const FLAG_DO_NOT_QUEUE: u32 = 0x4;

/// Owner/request flags for a well-known name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameFlags(pub u32);

impl NameFlags {
    /// The owner consents to replacement.
    #[must_use]
    pub const fn allow_replacement(self) -> bool {
        self.0 & FLAG_ALLOW_REPLACEMENT != 0
    }

    /// The requester wants to displace the current owner.
    #[must_use]
    pub const fn replace_existing(self) -> bool {
        self.0 & FLAG_REPLACE_EXISTING != 0
    }

    /// The requester refuses to wait in the queue.
    #[must_use]
    pub const fn do_not_queue(self) -> bool {
        self.0 & FLAG_DO_NOT_QUEUE != 0
    }
}

/// Reply codes for `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    /// The caller now owns the name.
    PrimaryOwner = 1,
    /// The caller was appended to the waiter queue.
    InQueue = 2,
    /// The name is taken and the caller declined to queue.
    Exists = 3,
    /// The caller already owned the name.
    AlreadyOwner = 4,
}

/// Reply codes for `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    /// The caller's ownership or queue slot was released.
    Released = 1,
    /// Nobody owns the name.
    NonExistent = 2,
    /// Somebody else owns the name and the caller was not queued.
    NotOwner = 3,
}

/// One ownership transition: `old_owner`/`new_owner` are unique names, with
/// the empty string meaning "nobody", exactly as `NameOwnerChanged` carries
/// them on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEvent {
    /// The name changing hands.
    pub name: String,
    /// Previous owner, or empty.
    pub old_owner: String,
    /// New owner, or empty.
    pub new_owner: String,
}

#[derive(Debug)]
struct QueuedWaiter {
    peer: PeerId,
    unique: String,
    flags: NameFlags,
}

#[derive(Debug)]
struct NameEntry {
    owner: PeerId,
    owner_unique: String,
    flags: NameFlags,
    queue: VecDeque<QueuedWaiter>,
}

/// Well-known and unique name ownership state.
#[derive(Debug)]
pub struct NameRegistry {
    /// Well-known names.
    names: HashMap<String, NameEntry>,
    /// Unique name → connection.
    unique_names: HashMap<String, PeerId>,
    /// Connection → its unique name.
    unique_by_peer: HashMap<PeerId, String>,
    /// Connection → well-known names it currently owns.
    owned_by_peer: HashMap<PeerId, HashSet<String>>,
    /// Connection → well-known names it waits on.
    waiting_by_peer: HashMap<PeerId, HashSet<String>>,
    /// Source of `:1.N` suffixes.
    counters: Arc<BusCounters>,
}

impl NameRegistry {
    /// Creates an empty registry drawing unique-name suffixes from
    /// `counters`.
    #[must_use]
    pub fn new(counters: Arc<BusCounters>) -> Self {
        Self {
            names: HashMap::new(),
            unique_names: HashMap::new(),
            unique_by_peer: HashMap::new(),
            owned_by_peer: HashMap::new(),
            waiting_by_peer: HashMap::new(),
            counters,
        }
    }

    /// Produces the next unique name, `:1.N`.
    #[must_use]
    pub fn assign_unique(&self) -> String {
        format!(":1.{}", self.counters.next_unique_suffix())
    }

    /// Records a freshly assigned unique name for `peer`.
    pub fn register_unique(&mut self, name: &str, peer: PeerId) -> NameEvent {
        self.unique_names.insert(name.to_owned(), peer);
        self.unique_by_peer.insert(peer, name.to_owned());
        NameEvent {
            name: name.to_owned(),
            old_owner: String::new(),
            new_owner: name.to_owned(),
        }
    }

    /// Requests ownership of a well-known name.
    pub fn request_name(
        &mut self,
        name: &str,
        flags: NameFlags,
        peer: PeerId,
        unique: &str,
    ) -> (RequestNameReply, Vec<NameEvent>) {
        if !self.names.contains_key(name) {
            self.install_owner(name, peer, unique, flags);
            let event = NameEvent {
                name: name.to_owned(),
                old_owner: String::new(),
                new_owner: unique.to_owned(),
            };
            return (RequestNameReply::PrimaryOwner, vec![event]);
        }
        let entry = self.names.get_mut(name).expect("checked above");

        if entry.owner == peer {
            // Re-requesting updates the owner's flags.
            entry.flags = flags;
            return (RequestNameReply::AlreadyOwner, Vec::new());
        }

        if flags.replace_existing() && entry.flags.allow_replacement() {
            let old_peer = entry.owner;
            let old_unique = entry.owner_unique.clone();
            entry.owner = peer;
            entry.owner_unique = unique.to_owned();
            entry.flags = flags;
            // The caller may have been queued from an earlier request.
            Self::drop_waiter(entry, peer);
            self.unindex_owned(old_peer, name);
            self.unindex_waiting(peer, name);
            self.index_owned(peer, name);
            let event = NameEvent {
                name: name.to_owned(),
                old_owner: old_unique,
                new_owner: unique.to_owned(),
            };
            return (RequestNameReply::PrimaryOwner, vec![event]);
        }

        if flags.do_not_queue() {
            // A queued waiter turning on DO_NOT_QUEUE backs out of the queue.
            if Self::drop_waiter(entry, peer) {
                self.unindex_waiting(peer, name);
            }
            return (RequestNameReply::Exists, Vec::new());
        }

        if let Some(waiter) = entry.queue.iter_mut().find(|w| w.peer == peer) {
            waiter.flags = flags;
        } else {
            entry.queue.push_back(QueuedWaiter {
                peer,
                unique: unique.to_owned(),
                flags,
            });
            self.waiting_by_peer
                .entry(peer)
                .or_default()
                .insert(name.to_owned());
        }
        (RequestNameReply::InQueue, Vec::new())
    }

    /// Releases ownership of, or a queue slot for, a well-known name.
    pub fn release_name(
        &mut self,
        name: &str,
        peer: PeerId,
    ) -> (ReleaseNameReply, Vec<NameEvent>) {
        let is_owner = match self.names.get(name) {
            None => return (ReleaseNameReply::NonExistent, Vec::new()),
            Some(entry) => entry.owner == peer,
        };

        if is_owner {
            self.unindex_owned(peer, name);
            let events = self.promote_or_remove(name);
            return (ReleaseNameReply::Released, events);
        }

        let dropped = self
            .names
            .get_mut(name)
            .is_some_and(|entry| Self::drop_waiter(entry, peer));
        if dropped {
            self.unindex_waiting(peer, name);
            return (ReleaseNameReply::Released, Vec::new());
        }

        (ReleaseNameReply::NotOwner, Vec::new())
    }

    /// Resolves a bus name to its owning connection.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PeerId> {
        if let Some(peer) = self.unique_names.get(name) {
            return Some(*peer);
        }
        self.names.get(name).map(|entry| entry.owner)
    }

    /// Returns the unique name owning `name`, for `GetNameOwner`.
    #[must_use]
    pub fn owner_unique<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.unique_names.contains_key(name) {
            return Some(name);
        }
        self.names.get(name).map(|entry| entry.owner_unique.as_str())
    }

    /// All well-known names with a current owner.
    pub fn well_known_names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    /// All registered unique names.
    pub fn unique_names(&self) -> impl Iterator<Item = &str> {
        self.unique_names.keys().map(String::as_str)
    }

    /// The unique name of a connection, if it said `Hello`.
    #[must_use]
    pub fn unique_of(&self, peer: PeerId) -> Option<&str> {
        self.unique_by_peer.get(&peer).map(String::as_str)
    }

    /// Releases everything a disconnecting peer held: owned names (promoting
    /// successors), queue slots, and finally the unique name itself.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Vec<NameEvent> {
        let mut events = Vec::new();

        for name in self.owned_by_peer.remove(&peer).unwrap_or_default() {
            events.extend(self.promote_or_remove(&name));
        }

        for name in self.waiting_by_peer.remove(&peer).unwrap_or_default() {
            if let Some(entry) = self.names.get_mut(&name) {
                Self::drop_waiter(entry, peer);
            }
        }

        if let Some(unique) = self.unique_by_peer.remove(&peer) {
            self.unique_names.remove(&unique);
            events.push(NameEvent {
                name: unique.clone(),
                old_owner: unique,
                new_owner: String::new(),
            });
        }

        events
    }

    /// `true` while any state still references `peer`; test support.
    #[cfg(test)]
    fn references(&self, peer: PeerId) -> bool {
        self.unique_by_peer.contains_key(&peer)
            || self.owned_by_peer.contains_key(&peer)
            || self.waiting_by_peer.contains_key(&peer)
            || self.names.values().any(|entry| {
                entry.owner == peer || entry.queue.iter().any(|w| w.peer == peer)
            })
    }

    fn install_owner(&mut self, name: &str, peer: PeerId, unique: &str, flags: NameFlags) {
        self.names.insert(
            name.to_owned(),
            NameEntry {
                owner: peer,
                owner_unique: unique.to_owned(),
                flags,
                queue: VecDeque::new(),
            },
        );
        self.index_owned(peer, name);
    }

    /// Promotes the queue head of `name` or removes the entry. The previous
    /// owner must already be unindexed.
    fn promote_or_remove(&mut self, name: &str) -> Vec<NameEvent> {
        let Some(entry) = self.names.get_mut(name) else {
            return Vec::new();
        };
        let old_unique = entry.owner_unique.clone();

        if let Some(next) = entry.queue.pop_front() {
            entry.owner = next.peer;
            entry.owner_unique = next.unique.clone();
            entry.flags = next.flags;
            self.unindex_waiting(next.peer, name);
            self.index_owned(next.peer, name);
            vec![NameEvent {
                name: name.to_owned(),
                old_owner: old_unique,
                new_owner: next.unique,
            }]
        } else {
            self.names.remove(name);
            vec![NameEvent {
                name: name.to_owned(),
                old_owner: old_unique,
                new_owner: String::new(),
            }]
        }
    }

    fn drop_waiter(entry: &mut NameEntry, peer: PeerId) -> bool {
        let before = entry.queue.len();
        entry.queue.retain(|w| w.peer != peer);
        entry.queue.len() != before
    }

    fn index_owned(&mut self, peer: PeerId, name: &str) {
        self.owned_by_peer
            .entry(peer)
            .or_default()
            .insert(name.to_owned());
    }

    fn unindex_owned(&mut self, peer: PeerId, name: &str) {
        if let Some(set) = self.owned_by_peer.get_mut(&peer) {
            set.remove(name);
            if set.is_empty() {
                self.owned_by_peer.remove(&peer);
            }
        }
    }

    fn unindex_waiting(&mut self, peer: PeerId, name: &str) {
        if let Some(set) = self.waiting_by_peer.get_mut(&peer) {
            set.remove(name);
            if set.is_empty() {
                self.waiting_by_peer.remove(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "com.example.Svc";

    fn registry() -> NameRegistry {
        NameRegistry::new(Arc::new(BusCounters::new()))
    }

    fn hello(reg: &mut NameRegistry, peer: PeerId) -> String {
        let unique = reg.assign_unique();
        reg.register_unique(&unique, peer);
        unique
    }

    #[test]
    fn unique_names_are_monotonic() {
        let reg = registry();
        let first = reg.assign_unique();
        let second = reg.assign_unique();
        assert!(first.starts_with(":1."));
        assert_ne!(first, second);
    }

    #[test]
    fn first_request_grants_ownership() {
        let mut reg = registry();
        let a = PeerId::from_raw(1);
        let ua = hello(&mut reg, a);

        let (reply, events) = reg.request_name(NAME, NameFlags(0), a, &ua);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(
            events,
            vec![NameEvent {
                name: NAME.into(),
                old_owner: String::new(),
                new_owner: ua.clone(),
            }]
        );
        assert_eq!(reg.resolve(NAME), Some(a));
        assert_eq!(reg.owner_unique(NAME), Some(ua.as_str()));
    }

    #[test]
    fn repeat_request_reports_already_owner() {
        let mut reg = registry();
        let a = PeerId::from_raw(1);
        let ua = hello(&mut reg, a);
        reg.request_name(NAME, NameFlags(0), a, &ua);

        let (reply, events) = reg.request_name(NAME, NameFlags(0), a, &ua);
        assert_eq!(reply, RequestNameReply::AlreadyOwner);
        assert!(events.is_empty());
    }

    #[test]
    fn second_requester_queues() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);

        let (reply, events) = reg.request_name(NAME, NameFlags(0), b, &ub);
        assert_eq!(reply, RequestNameReply::InQueue);
        assert!(events.is_empty());
        assert_eq!(reg.resolve(NAME), Some(a));
    }

    #[test]
    fn do_not_queue_returns_exists() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);

        let (reply, _) = reg.request_name(NAME, NameFlags(FLAG_DO_NOT_QUEUE), b, &ub);
        assert_eq!(reply, RequestNameReply::Exists);
    }

    #[test]
    fn release_promotes_queue_head_with_single_transfer_event() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);
        reg.request_name(NAME, NameFlags(0), b, &ub);

        let (reply, events) = reg.release_name(NAME, a);
        assert_eq!(reply, ReleaseNameReply::Released);
        // Ownership transfer: one event with both old and new, never an
        // intermediate "released" event.
        assert_eq!(
            events,
            vec![NameEvent {
                name: NAME.into(),
                old_owner: ua,
                new_owner: ub,
            }]
        );
        assert_eq!(reg.resolve(NAME), Some(b));
    }

    #[test]
    fn release_with_empty_queue_removes_entry() {
        let mut reg = registry();
        let a = PeerId::from_raw(1);
        let ua = hello(&mut reg, a);
        reg.request_name(NAME, NameFlags(0), a, &ua);

        let (reply, events) = reg.release_name(NAME, a);
        assert_eq!(reply, ReleaseNameReply::Released);
        assert_eq!(events[0].new_owner, "");
        assert_eq!(reg.resolve(NAME), None);

        let (reply, _) = reg.release_name(NAME, a);
        assert_eq!(reply, ReleaseNameReply::NonExistent);
    }

    #[test]
    fn release_by_non_owner_fails() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);

        let (reply, _) = reg.release_name(NAME, b);
        assert_eq!(reply, ReleaseNameReply::NotOwner);
    }

    #[test]
    fn queued_waiter_can_release_its_slot() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);
        reg.request_name(NAME, NameFlags(0), b, &ub);

        let (reply, events) = reg.release_name(NAME, b);
        assert_eq!(reply, ReleaseNameReply::Released);
        assert!(events.is_empty());

        // A now releases into an empty queue.
        let (_, events) = reg.release_name(NAME, a);
        assert_eq!(events[0].new_owner, "");
    }

    #[test]
    fn replacement_requires_both_flags() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);

        // Owner does not allow replacement: requester queues.
        reg.request_name(NAME, NameFlags(0), a, &ua);
        let (reply, _) =
            reg.request_name(NAME, NameFlags(FLAG_REPLACE_EXISTING), b, &ub);
        assert_eq!(reply, RequestNameReply::InQueue);
        reg.release_name(NAME, b);
        reg.release_name(NAME, a);

        // Owner allows replacement: requester takes over with one event.
        reg.request_name(NAME, NameFlags(FLAG_ALLOW_REPLACEMENT), a, &ua);
        let (reply, events) =
            reg.request_name(NAME, NameFlags(FLAG_REPLACE_EXISTING), b, &ub);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(
            events,
            vec![NameEvent {
                name: NAME.into(),
                old_owner: ua,
                new_owner: ub,
            }]
        );
        assert_eq!(reg.resolve(NAME), Some(b));
    }

    #[test]
    fn disconnect_releases_everything() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);
        reg.request_name("com.example.Other", NameFlags(0), a, &ua);
        reg.request_name(NAME, NameFlags(0), b, &ub);

        let events = reg.peer_disconnected(a);
        // NAME transfers to b, Other disappears, and the unique name goes.
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.name == NAME && e.new_owner == ub));
        assert!(events
            .iter()
            .any(|e| e.name == "com.example.Other" && e.new_owner.is_empty()));
        assert!(events
            .iter()
            .any(|e| e.name == ua && e.new_owner.is_empty()));
        assert!(!reg.references(a));
        assert_eq!(reg.resolve(NAME), Some(b));
    }

    #[test]
    fn disconnect_of_queued_waiter_leaves_owner_untouched() {
        let mut reg = registry();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        let ua = hello(&mut reg, a);
        let ub = hello(&mut reg, b);
        reg.request_name(NAME, NameFlags(0), a, &ua);
        reg.request_name(NAME, NameFlags(0), b, &ub);

        let events = reg.peer_disconnected(b);
        // Only the unique-name disappearance.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, ub);
        assert!(!reg.references(b));
        assert_eq!(reg.resolve(NAME), Some(a));

        // Owner release now finds an empty queue.
        let (_, events) = reg.release_name(NAME, a);
        assert_eq!(events[0].new_owner, "");
    }

    #[test]
    fn request_release_cycle_is_idempotent() {
        let mut reg = registry();
        let a = PeerId::from_raw(1);
        let ua = hello(&mut reg, a);

        let (_, acquire) = reg.request_name(NAME, NameFlags(0), a, &ua);
        let (_, release) = reg.release_name(NAME, a);
        assert_eq!(acquire.len(), 1);
        assert_eq!(release.len(), 1);
        // Inverse payloads.
        assert_eq!(acquire[0].old_owner, release[0].new_owner);
        assert_eq!(acquire[0].new_owner, release[0].old_owner);
        assert_eq!(reg.resolve(NAME), None);
        assert_eq!(reg.well_known_names().count(), 0);
    }
}
