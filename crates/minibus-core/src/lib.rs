//! D-Bus wire protocol library.
//!
//! This crate holds everything about the protocol that does not require a
//! socket: the signature grammar, the value model, the alignment-sensitive
//! codec, the message framer, match-rule parsing and evaluation, and name
//! grammar validation. The broker daemon builds on these; so can test
//! clients and tooling.
//!
//! # Layering
//!
//! ```text
//! framer      fixed header + field array + aligned body
//!   └── codec     values at absolute offsets, dual endianness
//!        └── signature   type grammar and alignment table
//! matchrule   subscription filters over decoded messages
//! names       bus/interface/member/path grammar
//! ```
//!
//! Everything here is pure and synchronous. Decoding is incremental: partial
//! input is reported as [`WireError::InsufficientData`] (or `Ok(None)` from
//! the framer), never as a protocol violation.

pub mod codec;
pub mod error;
pub mod framer;
pub mod matchrule;
pub mod message;
pub mod names;
pub mod signature;
pub mod value;

pub use codec::{Decoder, Encoder, Endian};
pub use error::WireError;
pub use matchrule::{MatchRule, MatchRuleError};
pub use message::{HeaderFlags, Message, MessageKind};
pub use signature::{SignatureError, Type};
pub use value::Value;
