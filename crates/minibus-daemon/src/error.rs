//! Broker error types and wire error names.

use minibus_core::WireError;
use thiserror::Error;

use crate::handshake::HandshakeError;

/// Well-known D-Bus error names the broker puts on the wire.
pub mod name {
    /// The destination name has no owner and cannot be activated.
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    /// `GetNameOwner` on a name without an owner.
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// No such method on the addressed interface.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// No such interface on the addressed object.
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    /// No such property on the addressed interface.
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    /// `AddMatch` argument failed to parse.
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    /// `RemoveMatch` argument names no installed rule.
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    /// Policy denied the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// Catch-all failure, notably `Hello` called twice.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// A method argument failed validation.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// The operation is not supported on this transport.
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    /// A per-peer resource bound was exceeded.
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
}

/// Fatal per-connection errors. Any of these terminates the peer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The peer produced undecodable bytes.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The peer violated the handshake protocol.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// The handshake did not complete within the configured deadline.
    #[error("handshake deadline exceeded")]
    HandshakeTimeout,

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A message declared more descriptors than the transport delivered.
    #[error("message declared {declared} descriptors but {available} arrived")]
    FdCountMismatch {
        /// Count from the `unix_fds` header field.
        declared: u32,
        /// Descriptors actually queued on the connection.
        available: usize,
    },

    /// A message declared more descriptors than the broker accepts.
    #[error("message carries {0} descriptors, above the per-message limit")]
    TooManyFds(u32),

    /// The peer's outbound queue overflowed; it is too slow to keep.
    #[error("outbound queue overflow")]
    QueueOverflow,

    /// The router went away mid-connection (broker shutting down).
    #[error("router unavailable")]
    RouterGone,
}
