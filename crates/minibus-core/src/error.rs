//! Wire-level error types.

use thiserror::Error;

use crate::signature::SignatureError;

/// Errors produced while encoding or decoding wire data.
///
/// `InsufficientData` is special: it is not a protocol violation but a
/// request for more bytes from the transport. Every other variant is fatal
/// for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ends before the next needed span. Read more and retry.
    #[error("insufficient data: need {needed} more bytes")]
    InsufficientData {
        /// Lower bound on the number of missing bytes.
        needed: usize,
    },

    /// A boolean wire value other than 0 or 1.
    #[error("invalid boolean value {0}")]
    InvalidBoolean(u32),

    /// String data that is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A string missing its NUL terminator, or carrying an embedded NUL.
    #[error("string is not NUL-terminated")]
    MissingNulTerminator,

    /// An object path violating the path grammar.
    #[error("invalid object path {0:?}")]
    InvalidObjectPath(String),

    /// A signature that fails to parse.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// An array longer than the 64 MiB wire limit.
    #[error("array of {0} bytes exceeds the wire limit")]
    ArrayTooLong(u32),

    /// Array contents did not end exactly at the declared length.
    #[error("array contents overran the declared length")]
    ArrayLengthMismatch,

    /// The value handed to the encoder does not match the requested type.
    #[error("type mismatch: value {value} cannot encode as {expected}")]
    TypeMismatch {
        /// Signature of the value that was supplied.
        value: String,
        /// Signature the caller asked for.
        expected: String,
    },

    /// An endianness marker other than `l` or `B`.
    #[error("unknown endianness marker {0:?}")]
    UnknownEndianness(u8),

    /// A message kind byte outside 1..=4.
    #[error("invalid message kind {0}")]
    InvalidMessageKind(u8),

    /// A major protocol version other than 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// Serial 0 is reserved and never valid on the wire.
    #[error("message serial must be non-zero")]
    InvalidSerial,

    /// A header field variant holding the wrong type for its code.
    #[error("header field {code} has the wrong type")]
    InvalidHeaderField {
        /// Field code from the header array.
        code: u8,
    },

    /// A required header field is absent for the message kind.
    #[error("missing required header field {0}")]
    MissingHeaderField(&'static str),

    /// The declared sizes add up to more than the message size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Declared total size.
        size: usize,
        /// Enforced limit.
        limit: usize,
    },

    /// Body decoding did not consume exactly the declared body length.
    #[error("body length mismatch: declared {declared}, decoded {decoded}")]
    BodyLengthMismatch {
        /// Length from the fixed header.
        declared: u32,
        /// Bytes actually consumed by the body signature.
        decoded: u32,
    },

    /// An underlying I/O failure surfaced through a byte-stream codec.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl WireError {
    /// `true` when the error merely signals a partial read.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}
