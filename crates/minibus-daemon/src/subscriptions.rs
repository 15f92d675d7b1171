//! The subscription table: installed match rules, keyed by peer.
//!
//! `AddMatch` may install the same rule twice; the duplicates stack and each
//! `RemoveMatch` peels one off, so a library and its caller can manage the
//! same subscription independently.

use std::collections::HashMap;

use minibus_core::{MatchRule, Message};

use crate::peer::PeerId;

/// All installed match rules.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    rules: HashMap<PeerId, Vec<MatchRule>>,
}

impl SubscriptionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a rule for `peer`.
    pub fn add(&mut self, peer: PeerId, rule: MatchRule) {
        self.rules.entry(peer).or_default().push(rule);
    }

    /// Removes one instance of an identical rule. Returns `false` when the
    /// peer has no such rule installed.
    pub fn remove(&mut self, peer: PeerId, rule: &MatchRule) -> bool {
        let Some(rules) = self.rules.get_mut(&peer) else {
            return false;
        };
        let Some(index) = rules.iter().position(|r| r == rule) else {
            return false;
        };
        rules.remove(index);
        if rules.is_empty() {
            self.rules.remove(&peer);
        }
        true
    }

    /// Drops every rule owned by `peer`.
    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.rules.remove(&peer);
    }

    /// `true` when the peer has at least one rule installed.
    #[must_use]
    pub fn has_rules(&self, peer: PeerId) -> bool {
        self.rules.contains_key(&peer)
    }

    /// Peers with at least one rule matching `message`; the fan-out set for
    /// broadcast signals.
    #[must_use]
    pub fn matching_peers(&self, message: &Message) -> Vec<PeerId> {
        self.rules
            .iter()
            .filter(|(_, rules)| rules.iter().any(|rule| rule.matches(message)))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Peers with a matching `eavesdrop=true` rule; candidates for unicast
    /// tap delivery, still subject to the policy gate.
    #[must_use]
    pub fn eavesdroppers(&self, message: &Message) -> Vec<PeerId> {
        self.rules
            .iter()
            .filter(|(_, rules)| {
                rules
                    .iter()
                    .any(|rule| rule.eavesdrop && rule.matches(message))
            })
            .map(|(peer, _)| *peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(text: &str) -> MatchRule {
        MatchRule::parse(text).unwrap()
    }

    fn signal(interface: &str) -> Message {
        Message::signal("/obj", interface, "Changed").with_serial(1)
    }

    #[test]
    fn matching_peers_respects_rules() {
        let mut table = SubscriptionTable::new();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        table.add(a, rule("type='signal',interface='com.x'"));
        table.add(b, rule("type='signal',interface='com.y'"));

        let peers = table.matching_peers(&signal("com.x"));
        assert_eq!(peers, vec![a]);
    }

    #[test]
    fn duplicate_rules_stack() {
        let mut table = SubscriptionTable::new();
        let a = PeerId::from_raw(1);
        let r = rule("interface='com.x'");
        table.add(a, r.clone());
        table.add(a, r.clone());

        assert!(table.remove(a, &r));
        assert!(table.has_rules(a));
        assert!(table.remove(a, &r));
        assert!(!table.has_rules(a));
        assert!(!table.remove(a, &r));
    }

    #[test]
    fn remove_is_insensitive_to_quoting() {
        let mut table = SubscriptionTable::new();
        let a = PeerId::from_raw(1);
        table.add(a, rule("interface='com.x'"));
        assert!(table.remove(a, &rule("interface=com.x")));
    }

    #[test]
    fn eavesdroppers_are_separate_from_matchers() {
        let mut table = SubscriptionTable::new();
        let (a, b) = (PeerId::from_raw(1), PeerId::from_raw(2));
        table.add(a, rule("eavesdrop='true'"));
        table.add(b, rule(""));

        let call = Message::method_call("/obj", "M")
            .with_destination(":1.9")
            .with_serial(1);
        assert_eq!(table.eavesdroppers(&call), vec![a]);
        // b matches everything but did not ask to eavesdrop.
        assert!(!table.eavesdroppers(&call).contains(&b));
    }

    #[test]
    fn teardown_drops_all_rules() {
        let mut table = SubscriptionTable::new();
        let a = PeerId::from_raw(1);
        table.add(a, rule("interface='com.x'"));
        table.add(a, rule("interface='com.y'"));
        table.peer_disconnected(a);
        assert!(!table.has_rules(a));
        assert!(table.matching_peers(&signal("com.x")).is_empty());
    }
}
