//! D-Bus type signatures.
//!
//! A signature is a compact string describing one or more D-Bus types, e.g.
//! `a{sv}` for a dictionary of string to variant. This module parses signature
//! text into a [`Type`] tree and serializes the tree back.
//!
//! # Grammar
//!
//! ```text
//! basic     = y | b | n | q | i | u | x | t | d | s | o | g | h
//! complete  = basic | v | a complete | ( complete+ ) | a { basic complete }
//! signature = complete*
//! ```
//!
//! Dict entries (`{...}`) are only legal directly inside an array, must hold
//! exactly two types, and the key must be a basic type. Container nesting is
//! bounded at [`MAX_DEPTH`] and the overall signature at [`MAX_SIGNATURE_LEN`]
//! bytes; both limits are validated BEFORE any tree is built up, so malformed
//! input cannot cause unbounded recursion.

use std::fmt;

use thiserror::Error;

/// Maximum container nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 32;

/// Maximum signature length in bytes (the wire format stores it in a u8).
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Errors produced while parsing a signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// A type code outside the D-Bus alphabet.
    #[error("unknown type code {0:?}")]
    UnknownTypeCode(char),

    /// `(` without a matching `)`.
    #[error("unterminated struct")]
    UnterminatedStruct,

    /// `{` without a matching `}`.
    #[error("unterminated dict entry")]
    UnterminatedDictEntry,

    /// `{...}` appearing anywhere but directly inside an array.
    #[error("dict entry outside array")]
    DictEntryOutsideArray,

    /// `()` carries no member types.
    #[error("empty struct")]
    EmptyStruct,

    /// A dict entry must hold exactly a key and a value.
    #[error("dict entry must contain exactly two types")]
    DictEntryArity,

    /// Dict entry keys must be basic types.
    #[error("dict entry key must be a basic type")]
    DictEntryBasicKey,

    /// `a` with nothing following it.
    #[error("array without element type")]
    MissingArrayElement,

    /// Input continued past the requested number of complete types.
    #[error("trailing characters after complete type")]
    TrailingCharacters,

    /// Container nesting exceeded [`MAX_DEPTH`].
    #[error("signature exceeds maximum nesting depth of {MAX_DEPTH}")]
    TooDeep,

    /// Signature longer than [`MAX_SIGNATURE_LEN`] bytes.
    #[error("signature exceeds {MAX_SIGNATURE_LEN} bytes")]
    TooLong,

    /// An empty signature where one complete type was required.
    #[error("empty signature")]
    Empty,
}

/// A parsed D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// 8-bit unsigned integer (`y`).
    Byte,
    /// Boolean, wire-encoded as a u32 restricted to 0/1 (`b`).
    Boolean,
    /// 16-bit signed integer (`n`).
    Int16,
    /// 16-bit unsigned integer (`q`).
    UInt16,
    /// 32-bit signed integer (`i`).
    Int32,
    /// 32-bit unsigned integer (`u`).
    UInt32,
    /// 64-bit signed integer (`x`).
    Int64,
    /// 64-bit unsigned integer (`t`).
    UInt64,
    /// IEEE 754 double (`d`).
    Double,
    /// UTF-8 string (`s`).
    String,
    /// Object path (`o`).
    ObjectPath,
    /// Type signature (`g`).
    Signature,
    /// Index into the message's out-of-band descriptor list (`h`).
    UnixFd,
    /// Homogeneous sequence (`a`).
    Array(Box<Type>),
    /// Heterogeneous product (`(...)`).
    Struct(Vec<Type>),
    /// Key/value pair, only legal as an array element (`{...}`).
    DictEntry(Box<Type>, Box<Type>),
    /// Self-describing value (`v`).
    Variant,
}

impl Type {
    /// Parses exactly one complete type.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::TrailingCharacters`] if input remains after
    /// the first complete type, and the relevant grammar error otherwise.
    pub fn parse(signature: &str) -> Result<Self, SignatureError> {
        let mut types = Self::parse_many(signature)?;
        match types.len() {
            0 => Err(SignatureError::Empty),
            1 => Ok(types.remove(0)),
            _ => Err(SignatureError::TrailingCharacters),
        }
    }

    /// Parses a sequence of complete types (possibly empty).
    pub fn parse_many(signature: &str) -> Result<Vec<Self>, SignatureError> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let mut chars = signature.chars().peekable();
        let mut types = Vec::new();
        while chars.peek().is_some() {
            types.push(parse_complete(&mut chars, 0)?);
        }
        Ok(types)
    }

    /// Returns the wire alignment of this type: 1, 2, 4, or 8.
    #[must_use]
    pub fn alignment(&self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Boolean
            | Self::Int32
            | Self::UInt32
            | Self::UnixFd
            | Self::String
            | Self::ObjectPath
            | Self::Array(_) => 4,
            Self::Int64
            | Self::UInt64
            | Self::Double
            | Self::Struct(_)
            | Self::DictEntry(..) => 8,
        }
    }

    /// Returns `true` for the basic (non-container) types.
    #[must_use]
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Array(_) | Self::Struct(_) | Self::DictEntry(..) | Self::Variant
        )
    }

    /// Serializes this type back to signature text.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut out = String::new();
        write_signature(self, &mut out);
        out
    }

    /// Serializes a sequence of types to signature text.
    #[must_use]
    pub fn signature_of(types: &[Self]) -> String {
        let mut out = String::new();
        for ty in types {
            write_signature(ty, &mut out);
        }
        out
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

fn write_signature(ty: &Type, out: &mut String) {
    match ty {
        Type::Byte => out.push('y'),
        Type::Boolean => out.push('b'),
        Type::Int16 => out.push('n'),
        Type::UInt16 => out.push('q'),
        Type::Int32 => out.push('i'),
        Type::UInt32 => out.push('u'),
        Type::Int64 => out.push('x'),
        Type::UInt64 => out.push('t'),
        Type::Double => out.push('d'),
        Type::String => out.push('s'),
        Type::ObjectPath => out.push('o'),
        Type::Signature => out.push('g'),
        Type::UnixFd => out.push('h'),
        Type::Variant => out.push('v'),
        Type::Array(elem) => {
            out.push('a');
            write_signature(elem, out);
        },
        Type::Struct(members) => {
            out.push('(');
            for member in members {
                write_signature(member, out);
            }
            out.push(')');
        },
        Type::DictEntry(key, value) => {
            out.push('{');
            write_signature(key, out);
            write_signature(value, out);
            out.push('}');
        },
    }
}

fn parse_complete(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    depth: usize,
) -> Result<Type, SignatureError> {
    if depth > MAX_DEPTH {
        return Err(SignatureError::TooDeep);
    }

    let code = chars.next().ok_or(SignatureError::Empty)?;
    match code {
        'y' => Ok(Type::Byte),
        'b' => Ok(Type::Boolean),
        'n' => Ok(Type::Int16),
        'q' => Ok(Type::UInt16),
        'i' => Ok(Type::Int32),
        'u' => Ok(Type::UInt32),
        'x' => Ok(Type::Int64),
        't' => Ok(Type::UInt64),
        'd' => Ok(Type::Double),
        's' => Ok(Type::String),
        'o' => Ok(Type::ObjectPath),
        'g' => Ok(Type::Signature),
        'h' => Ok(Type::UnixFd),
        'v' => Ok(Type::Variant),
        'a' => {
            if chars.peek().is_none() {
                return Err(SignatureError::MissingArrayElement);
            }
            // A dict entry is only legal here, directly under the array.
            if chars.peek() == Some(&'{') {
                chars.next();
                let entry = parse_dict_entry(chars, depth + 1)?;
                return Ok(Type::Array(Box::new(entry)));
            }
            let elem = parse_complete(chars, depth + 1)?;
            Ok(Type::Array(Box::new(elem)))
        },
        '(' => {
            let mut members = Vec::new();
            loop {
                match chars.peek() {
                    None => return Err(SignatureError::UnterminatedStruct),
                    Some(')') => {
                        chars.next();
                        break;
                    },
                    Some(_) => members.push(parse_complete(chars, depth + 1)?),
                }
            }
            if members.is_empty() {
                return Err(SignatureError::EmptyStruct);
            }
            Ok(Type::Struct(members))
        },
        '{' => Err(SignatureError::DictEntryOutsideArray),
        other => Err(SignatureError::UnknownTypeCode(other)),
    }
}

fn parse_dict_entry(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    depth: usize,
) -> Result<Type, SignatureError> {
    if depth > MAX_DEPTH {
        return Err(SignatureError::TooDeep);
    }

    let mut members = Vec::new();
    loop {
        match chars.peek() {
            None => return Err(SignatureError::UnterminatedDictEntry),
            Some('}') => {
                chars.next();
                break;
            },
            Some(_) => {
                if members.len() == 2 {
                    return Err(SignatureError::DictEntryArity);
                }
                members.push(parse_complete(chars, depth + 1)?);
            },
        }
    }

    if members.len() != 2 {
        return Err(SignatureError::DictEntryArity);
    }
    let value = members.pop().expect("checked length");
    let key = members.pop().expect("checked length");
    if !key.is_basic() {
        return Err(SignatureError::DictEntryBasicKey);
    }
    Ok(Type::DictEntry(Box::new(key), Box::new(value)))
}
