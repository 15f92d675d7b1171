//! Subscription match rules.
//!
//! A match rule is a comma-separated list of `key='value'` pairs, e.g.
//! `type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'`.
//! Peers install rules with `AddMatch`; the router evaluates every signal
//! against the installed rules to compute its fan-out set.
//!
//! Values may be quoted with single quotes; outside quotes a backslash
//! escapes the next character. Two rules are equal when their parsed content
//! is equal, so `RemoveMatch` is insensitive to quoting differences.

use std::fmt;

use thiserror::Error;

use crate::message::{Message, MessageKind};
use crate::value::Value;

/// Highest argument index addressable by `argN` filters.
pub const MAX_ARG_INDEX: u8 = 63;

/// Errors produced while parsing a match expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchRuleError {
    /// A key outside the supported set.
    #[error("unknown match key {0:?}")]
    UnknownKey(String),

    /// `argN` with N > [`MAX_ARG_INDEX`].
    #[error("argument index {0} out of range (max {MAX_ARG_INDEX})")]
    ArgIndexOutOfRange(u32),

    /// `type=` with a token that is not a message kind.
    #[error("invalid message type token {0:?}")]
    InvalidType(String),

    /// Structurally broken input (missing `=`, unterminated quote, ...).
    #[error("malformed match rule: {0}")]
    Malformed(&'static str),

    /// The same key given twice.
    #[error("duplicate match key {0:?}")]
    DuplicateKey(String),
}

/// One argument filter: index, expected string, and whether path-prefix
/// matching (`argNpath`) applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgFilter {
    /// Body value index.
    pub index: u8,
    /// Expected value.
    pub value: String,
    /// `true` for `argNpath` semantics.
    pub is_path: bool,
}

/// A parsed match rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    /// Restrict to one message kind.
    pub kind: Option<MessageKind>,
    /// Exact sender.
    pub sender: Option<String>,
    /// Exact interface.
    pub interface: Option<String>,
    /// Exact member.
    pub member: Option<String>,
    /// Exact object path.
    pub path: Option<String>,
    /// Path or `/`-separated path prefix.
    pub path_namespace: Option<String>,
    /// Exact destination.
    pub destination: Option<String>,
    /// Request delivery of unicast traffic addressed to other peers.
    pub eavesdrop: bool,
    /// Argument filters, ordered by index.
    pub args: Vec<ArgFilter>,
}

impl MatchRule {
    /// Parses a match expression.
    pub fn parse(text: &str) -> Result<Self, MatchRuleError> {
        let mut rule = Self::default();
        for (key, value) in split_pairs(text)? {
            rule.apply(&key, value)?;
        }
        rule.args.sort_by_key(|f| (f.index, f.is_path));
        Ok(rule)
    }

    fn apply(&mut self, key: &str, value: String) -> Result<(), MatchRuleError> {
        let duplicate = || MatchRuleError::DuplicateKey(key.to_owned());
        match key {
            "type" => {
                let kind = match value.as_str() {
                    "method_call" => MessageKind::MethodCall,
                    "method_return" => MessageKind::MethodReturn,
                    "error" => MessageKind::Error,
                    "signal" => MessageKind::Signal,
                    _ => return Err(MatchRuleError::InvalidType(value)),
                };
                if self.kind.replace(kind).is_some() {
                    return Err(duplicate());
                }
            },
            "sender" => set_once(&mut self.sender, value).map_err(|()| duplicate())?,
            "interface" => set_once(&mut self.interface, value).map_err(|()| duplicate())?,
            "member" => set_once(&mut self.member, value).map_err(|()| duplicate())?,
            "path" => set_once(&mut self.path, value).map_err(|()| duplicate())?,
            "path_namespace" => {
                set_once(&mut self.path_namespace, value).map_err(|()| duplicate())?;
            },
            "destination" => {
                set_once(&mut self.destination, value).map_err(|()| duplicate())?;
            },
            "eavesdrop" => self.eavesdrop = value == "true",
            _ => {
                if let Some(rest) = key.strip_prefix("arg") {
                    let (index_text, is_path) = rest
                        .strip_suffix("path")
                        .map_or((rest, false), |idx| (idx, true));
                    let index: u32 = index_text
                        .parse()
                        .map_err(|_| MatchRuleError::UnknownKey(key.to_owned()))?;
                    if index > u32::from(MAX_ARG_INDEX) {
                        return Err(MatchRuleError::ArgIndexOutOfRange(index));
                    }
                    #[allow(clippy::cast_possible_truncation)] // bounded above
                    let index = index as u8;
                    if self
                        .args
                        .iter()
                        .any(|f| f.index == index && f.is_path == is_path)
                    {
                        return Err(duplicate());
                    }
                    self.args.push(ArgFilter {
                        index,
                        value,
                        is_path,
                    });
                } else {
                    return Err(MatchRuleError::UnknownKey(key.to_owned()));
                }
            },
        }
        Ok(())
    }

    /// Evaluates this rule against a message.
    ///
    /// Every present key must match; absent keys match anything. This is the
    /// conjunction the router uses for signal fan-out and, for rules with
    /// `eavesdrop=true`, for unicast tap delivery.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kind) = self.kind {
            if message.kind() != kind {
                return false;
            }
        }
        if !optional_eq(self.sender.as_deref(), message.sender.as_deref()) {
            return false;
        }
        if !optional_eq(self.interface.as_deref(), message.interface.as_deref()) {
            return false;
        }
        if !optional_eq(self.member.as_deref(), message.member.as_deref()) {
            return false;
        }
        if !optional_eq(self.destination.as_deref(), message.destination.as_deref()) {
            return false;
        }
        if let Some(path) = &self.path {
            if message.path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(namespace) = &self.path_namespace {
            let Some(msg_path) = message.path.as_deref() else {
                return false;
            };
            if !is_path_prefix(namespace, msg_path) {
                return false;
            }
        }
        for filter in &self.args {
            let Some(value) = message.body.get(filter.index as usize) else {
                return false;
            };
            let matched = match value {
                Value::String(s) | Value::ObjectPath(s) => {
                    if filter.is_path {
                        is_path_prefix(&filter.value, s)
                    } else {
                        *s == filter.value
                    }
                },
                _ => false,
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut pair = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{key}='{value}'")
        };
        if let Some(kind) = self.kind {
            pair(f, "type", kind.token())?;
        }
        if let Some(v) = &self.sender {
            pair(f, "sender", v)?;
        }
        if let Some(v) = &self.interface {
            pair(f, "interface", v)?;
        }
        if let Some(v) = &self.member {
            pair(f, "member", v)?;
        }
        if let Some(v) = &self.path {
            pair(f, "path", v)?;
        }
        if let Some(v) = &self.path_namespace {
            pair(f, "path_namespace", v)?;
        }
        if let Some(v) = &self.destination {
            pair(f, "destination", v)?;
        }
        if self.eavesdrop {
            pair(f, "eavesdrop", "true")?;
        }
        for arg in &self.args {
            let key = if arg.is_path {
                format!("arg{}path", arg.index)
            } else {
                format!("arg{}", arg.index)
            };
            pair(f, &key, &arg.value)?;
        }
        Ok(())
    }
}

fn set_once(slot: &mut Option<String>, value: String) -> Result<(), ()> {
    if slot.replace(value).is_some() {
        return Err(());
    }
    Ok(())
}

fn optional_eq(wanted: Option<&str>, actual: Option<&str>) -> bool {
    wanted.is_none_or(|w| actual == Some(w))
}

/// `true` when `prefix` equals `path` or is a `/`-separated prefix of it.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix == path {
        return true;
    }
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Splits `key='value',key2='value2'` into pairs, honoring quotes and
/// backslash escapes outside quotes.
fn split_pairs(text: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let mut pairs = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        // Skip leading whitespace and empty segments.
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        let mut saw_eq = false;
        for c in chars.by_ref() {
            if c == '=' {
                saw_eq = true;
                break;
            }
            if c == ',' {
                return Err(MatchRuleError::Malformed("key without value"));
            }
            key.push(c);
        }
        if !saw_eq {
            return Err(MatchRuleError::Malformed("key without value"));
        }
        let key = key.trim().to_owned();
        if key.is_empty() {
            return Err(MatchRuleError::Malformed("empty key"));
        }

        let mut value = String::new();
        let mut in_quotes = false;
        let mut terminated = false;
        while let Some(c) = chars.next() {
            match c {
                '\'' => in_quotes = !in_quotes,
                '\\' if !in_quotes => {
                    let escaped = chars
                        .next()
                        .ok_or(MatchRuleError::Malformed("trailing backslash"))?;
                    value.push(escaped);
                },
                ',' if !in_quotes => {
                    terminated = true;
                    break;
                },
                _ => value.push(c),
            }
        }
        if in_quotes {
            return Err(MatchRuleError::Malformed("unterminated quote"));
        }
        pairs.push((key, value));
        if !terminated && chars.peek().is_none() {
            break;
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(interface: &str, member: &str) -> Message {
        Message::signal("/com/example/Object", interface, member)
            .with_sender(":1.7")
            .with_serial(1)
    }

    #[test]
    fn parses_typical_rule() {
        let rule =
            MatchRule::parse("type='signal',interface='com.x',member='Y'").unwrap();
        assert_eq!(rule.kind, Some(MessageKind::Signal));
        assert_eq!(rule.interface.as_deref(), Some("com.x"));
        assert_eq!(rule.member.as_deref(), Some("Y"));
    }

    #[test]
    fn quoting_is_normalized() {
        let quoted = MatchRule::parse("interface='com.x'").unwrap();
        let bare = MatchRule::parse("interface=com.x").unwrap();
        assert_eq!(quoted, bare);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            MatchRule::parse("flavor='spicy'"),
            Err(MatchRuleError::UnknownKey(_))
        ));
        assert_eq!(
            MatchRule::parse("arg64='x'"),
            Err(MatchRuleError::ArgIndexOutOfRange(64))
        );
        assert!(matches!(
            MatchRule::parse("type='gossip'"),
            Err(MatchRuleError::InvalidType(_))
        ));
        assert!(matches!(
            MatchRule::parse("interface='unterminated"),
            Err(MatchRuleError::Malformed(_))
        ));
        assert!(matches!(
            MatchRule::parse("member='a',member='b'"),
            Err(MatchRuleError::DuplicateKey(_))
        ));
        assert!(matches!(
            MatchRule::parse("argfoo='x'"),
            Err(MatchRuleError::UnknownKey(_))
        ));
    }

    #[test]
    fn matches_on_kind_interface_member() {
        let rule =
            MatchRule::parse("type='signal',interface='com.x',member='Y'").unwrap();
        assert!(rule.matches(&signal("com.x", "Y")));
        assert!(!rule.matches(&signal("com.other", "Y")));
        assert!(!rule.matches(&signal("com.x", "Z")));
        assert!(!rule.matches(&Message::method_call("/o", "Y").with_serial(1)));
    }

    #[test]
    fn absent_keys_match_anything() {
        let rule = MatchRule::parse("").unwrap();
        assert!(rule.matches(&signal("com.x", "Y")));
    }

    #[test]
    fn path_is_exact_and_namespace_is_prefix() {
        let exact = MatchRule::parse("path='/com/example/Object'").unwrap();
        assert!(exact.matches(&signal("com.x", "Y")));
        let other = MatchRule::parse("path='/com/example'").unwrap();
        assert!(!other.matches(&signal("com.x", "Y")));

        let ns = MatchRule::parse("path_namespace='/com/example'").unwrap();
        assert!(ns.matches(&signal("com.x", "Y")));
        let ns_exact = MatchRule::parse("path_namespace='/com/example/Object'").unwrap();
        assert!(ns_exact.matches(&signal("com.x", "Y")));
        // Not a segment boundary: /com/exam is not a path prefix of
        // /com/example/Object.
        let ns_partial = MatchRule::parse("path_namespace='/com/exam'").unwrap();
        assert!(!ns_partial.matches(&signal("com.x", "Y")));
    }

    #[test]
    fn arg_filters() {
        let msg = signal("com.x", "Y").with_body(vec![
            Value::String("com.example.Svc".into()),
            Value::String("/com/example/Obj".into()),
        ]);

        let rule = MatchRule::parse("arg0='com.example.Svc'").unwrap();
        assert!(rule.matches(&msg));

        let wrong = MatchRule::parse("arg0='com.example.Other'").unwrap();
        assert!(!wrong.matches(&msg));

        let missing = MatchRule::parse("arg5='x'").unwrap();
        assert!(!missing.matches(&msg));

        let path_rule = MatchRule::parse("arg1path='/com/example'").unwrap();
        assert!(path_rule.matches(&msg));
        let path_exact = MatchRule::parse("arg1path='/com/example/Obj'").unwrap();
        assert!(path_exact.matches(&msg));
        let path_miss = MatchRule::parse("arg1path='/com/exam'").unwrap();
        assert!(!path_miss.matches(&msg));
    }

    #[test]
    fn non_string_args_never_match() {
        let msg = signal("com.x", "Y").with_body(vec![Value::UInt32(5)]);
        let rule = MatchRule::parse("arg0='5'").unwrap();
        assert!(!rule.matches(&msg));
    }

    #[test]
    fn display_round_trips() {
        let text = "type='signal',sender=':1.3',interface='com.x',arg0='v',arg2path='/a'";
        let rule = MatchRule::parse(text).unwrap();
        let rendered = rule.to_string();
        assert_eq!(MatchRule::parse(&rendered).unwrap(), rule);
    }

    #[test]
    fn eavesdrop_key() {
        let rule = MatchRule::parse("eavesdrop='true'").unwrap();
        assert!(rule.eavesdrop);
        let rule = MatchRule::parse("eavesdrop='false'").unwrap();
        assert!(!rule.eavesdrop);
    }
}
