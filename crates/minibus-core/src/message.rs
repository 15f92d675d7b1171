//! The D-Bus message model.
//!
//! A [`Message`] is the unit the broker routes: a kind, a serial, header
//! fields, a typed body, and any file descriptors that travel out-of-band
//! with the bytes. Descriptors are owned by the message; dropping an
//! undelivered message closes them.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::signature::Type;
use crate::value::Value;

/// Message kinds, with their wire discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// A request expecting a reply unless `NO_REPLY_EXPECTED` is set.
    MethodCall = 1,
    /// A successful reply, correlated by `reply_serial`.
    MethodReturn = 2,
    /// A failure reply, correlated by `reply_serial`.
    Error = 3,
    /// A broadcast (or occasionally unicast) notification.
    Signal = 4,
}

impl MessageKind {
    /// Parses a wire kind byte. `0` is explicitly invalid.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }

    /// The wire discriminant.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    /// The token used by match rules (`type='signal'` etc.).
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

/// Header flag bits, carried opaquely by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    /// The sender does not want a method return.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Never activate the destination (activation is unsupported anyway).
    pub const NO_AUTO_START: u8 = 0x02;
    /// The sender permits interactive authorization.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x04;

    /// `true` when the sender declined a reply.
    #[must_use]
    pub const fn no_reply_expected(self) -> bool {
        self.0 & Self::NO_REPLY_EXPECTED != 0
    }
}

/// Header field codes from the wire format.
pub mod field_code {
    /// Object path.
    pub const PATH: u8 = 1;
    /// Interface name.
    pub const INTERFACE: u8 = 2;
    /// Member name.
    pub const MEMBER: u8 = 3;
    /// Error name.
    pub const ERROR_NAME: u8 = 4;
    /// Serial of the message this one replies to.
    pub const REPLY_SERIAL: u8 = 5;
    /// Destination bus name.
    pub const DESTINATION: u8 = 6;
    /// Sender unique name (stamped by the broker).
    pub const SENDER: u8 = 7;
    /// Body signature.
    pub const SIGNATURE: u8 = 8;
    /// Number of attached file descriptors.
    pub const UNIX_FDS: u8 = 9;
}

/// Validation errors for the per-kind required header fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// A header field required by the message kind is missing.
    #[error("{kind:?} message is missing required header field {field}")]
    MissingField {
        /// The message kind being validated.
        kind: MessageKind,
        /// Name of the missing field.
        field: &'static str,
    },
}

/// A routable D-Bus message.
#[derive(Debug, Default)]
pub struct Message {
    /// Message kind; defaults are only meaningful via the constructors.
    pub kind: Option<MessageKind>,
    /// Per-sender serial. Zero means "not yet stamped".
    pub serial: u32,
    /// Header flag bits.
    pub flags: HeaderFlags,
    /// Object path (method calls and signals).
    pub path: Option<String>,
    /// Interface name.
    pub interface: Option<String>,
    /// Member name (method calls and signals).
    pub member: Option<String>,
    /// Error name (error messages).
    pub error_name: Option<String>,
    /// Serial being replied to (returns and errors).
    pub reply_serial: Option<u32>,
    /// Destination bus name; absent for broadcasts.
    pub destination: Option<String>,
    /// Sender unique name; the broker stamps this, never the client.
    pub sender: Option<String>,
    /// Body signature as declared on the wire; `None` for an empty body.
    pub signature: Option<String>,
    /// Declared number of attached descriptors.
    pub unix_fds: u32,
    /// Body values, matching the body signature.
    pub body: Vec<Value>,
    /// Out-of-band descriptors, owned by this message.
    pub fds: Vec<OwnedFd>,
}

impl PartialEq for Message {
    /// Compares every field except `fds`: `OwnedFd` has no equality of its
    /// own, so descriptor-bearing messages are compared by their non-fd data.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.serial == other.serial
            && self.flags == other.flags
            && self.path == other.path
            && self.interface == other.interface
            && self.member == other.member
            && self.error_name == other.error_name
            && self.reply_serial == other.reply_serial
            && self.destination == other.destination
            && self.sender == other.sender
            && self.signature == other.signature
            && self.unix_fds == other.unix_fds
            && self.body == other.body
    }
}

impl Message {
    /// Starts a method call to `path`/`member`.
    #[must_use]
    pub fn method_call(path: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            kind: Some(MessageKind::MethodCall),
            path: Some(path.into()),
            member: Some(member.into()),
            ..Self::default()
        }
    }

    /// Starts a method return for `reply_serial`.
    #[must_use]
    pub fn method_return(reply_serial: u32) -> Self {
        Self {
            kind: Some(MessageKind::MethodReturn),
            reply_serial: Some(reply_serial),
            ..Self::default()
        }
    }

    /// Starts an error reply named `error_name` for `reply_serial`.
    #[must_use]
    pub fn error(error_name: impl Into<String>, reply_serial: u32) -> Self {
        Self {
            kind: Some(MessageKind::Error),
            error_name: Some(error_name.into()),
            reply_serial: Some(reply_serial),
            ..Self::default()
        }
    }

    /// Starts a signal on `path`, `interface`, `member`.
    #[must_use]
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            kind: Some(MessageKind::Signal),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::default()
        }
    }

    /// Sets the interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the serial.
    #[must_use]
    pub const fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Appends a body value.
    #[must_use]
    pub fn with_body_value(mut self, value: Value) -> Self {
        self.body.push(value);
        self
    }

    /// Replaces the whole body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// The message kind; panics only if constructed without a constructor.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind.expect("message built without a kind")
    }

    /// The body signature derived from the body values.
    #[must_use]
    pub fn body_signature(&self) -> String {
        let types: Vec<Type> = self.body.iter().map(Value::type_of).collect();
        Type::signature_of(&types)
    }

    /// Checks the per-kind required header fields.
    pub fn validate(&self) -> Result<(), MessageError> {
        let kind = self.kind();
        let missing = |field| MessageError::MissingField { kind, field };
        match kind {
            MessageKind::MethodCall => {
                self.path.as_ref().ok_or_else(|| missing("path"))?;
                self.member.as_ref().ok_or_else(|| missing("member"))?;
            },
            MessageKind::Signal => {
                self.path.as_ref().ok_or_else(|| missing("path"))?;
                self.member.as_ref().ok_or_else(|| missing("member"))?;
                self.interface.as_ref().ok_or_else(|| missing("interface"))?;
            },
            MessageKind::Error => {
                self.error_name.as_ref().ok_or_else(|| missing("error_name"))?;
                self.reply_serial.ok_or_else(|| missing("reply_serial"))?;
            },
            MessageKind::MethodReturn => {
                self.reply_serial.ok_or_else(|| missing("reply_serial"))?;
            },
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_round_trip() {
        for kind in [
            MessageKind::MethodCall,
            MessageKind::MethodReturn,
            MessageKind::Error,
            MessageKind::Signal,
        ] {
            assert_eq!(MessageKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire(0), None);
        assert_eq!(MessageKind::from_wire(5), None);
    }

    #[test]
    fn method_call_requires_path_and_member() {
        let msg = Message::method_call("/obj", "Do");
        assert!(msg.validate().is_ok());

        let mut broken = Message::method_call("/obj", "Do");
        broken.member = None;
        assert_eq!(
            broken.validate(),
            Err(MessageError::MissingField {
                kind: MessageKind::MethodCall,
                field: "member",
            })
        );
    }

    #[test]
    fn signal_requires_interface() {
        let msg = Message::signal("/obj", "com.example.Iface", "Changed");
        assert!(msg.validate().is_ok());

        let mut broken = Message::signal("/obj", "com.example.Iface", "Changed");
        broken.interface = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn error_requires_name_and_reply_serial() {
        let msg = Message::error("org.freedesktop.DBus.Error.Failed", 9);
        assert!(msg.validate().is_ok());

        let mut broken = Message::error("org.freedesktop.DBus.Error.Failed", 9);
        broken.reply_serial = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn body_signature_is_derived() {
        let msg = Message::method_call("/o", "M")
            .with_body_value(Value::String("s".into()))
            .with_body_value(Value::UInt32(4));
        assert_eq!(msg.body_signature(), "su");
        assert_eq!(Message::method_return(1).body_signature(), "");
    }

    #[test]
    fn no_reply_expected_flag() {
        let mut msg = Message::method_call("/o", "M");
        assert!(!msg.flags.no_reply_expected());
        msg.flags = HeaderFlags(HeaderFlags::NO_REPLY_EXPECTED);
        assert!(msg.flags.no_reply_expected());
    }
}
