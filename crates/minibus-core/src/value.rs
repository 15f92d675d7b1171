//! The D-Bus value model.
//!
//! [`Value`] is the in-memory form of everything that can travel in a message
//! body. Arrays carry their element [`Type`] explicitly so that empty arrays
//! stay fully typed; dict entries are modeled as a container value that is
//! only legal as an array element; variants box their inner value and derive
//! their signature from it.

use crate::signature::Type;

/// A single D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 8-bit unsigned integer.
    Byte(u8),
    /// Boolean; wire-encoded as a u32 restricted to 0/1.
    Boolean(bool),
    /// 16-bit signed integer.
    Int16(i16),
    /// 16-bit unsigned integer.
    UInt16(u16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// IEEE 754 double.
    Double(f64),
    /// UTF-8 string without embedded NULs.
    String(String),
    /// Object path; must satisfy the path grammar.
    ObjectPath(String),
    /// Type signature text.
    Signature(String),
    /// Index into the owning message's descriptor list.
    UnixFd(u32),
    /// Typed sequence. `elem` keeps empty arrays decodable.
    Array {
        /// Element type.
        elem: Type,
        /// Elements, each matching `elem`.
        items: Vec<Value>,
    },
    /// Heterogeneous product.
    Struct(Vec<Value>),
    /// Key/value pair; only legal inside an array of dict entries.
    DictEntry(Box<Value>, Box<Value>),
    /// Self-describing value.
    Variant(Box<Value>),
}

impl Value {
    /// Returns the [`Type`] this value encodes as.
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Byte(_) => Type::Byte,
            Self::Boolean(_) => Type::Boolean,
            Self::Int16(_) => Type::Int16,
            Self::UInt16(_) => Type::UInt16,
            Self::Int32(_) => Type::Int32,
            Self::UInt32(_) => Type::UInt32,
            Self::Int64(_) => Type::Int64,
            Self::UInt64(_) => Type::UInt64,
            Self::Double(_) => Type::Double,
            Self::String(_) => Type::String,
            Self::ObjectPath(_) => Type::ObjectPath,
            Self::Signature(_) => Type::Signature,
            Self::UnixFd(_) => Type::UnixFd,
            Self::Array { elem, .. } => Type::Array(Box::new(elem.clone())),
            Self::Struct(members) => {
                Type::Struct(members.iter().map(Self::type_of).collect())
            },
            Self::DictEntry(key, value) => Type::DictEntry(
                Box::new(key.type_of()),
                Box::new(value.type_of()),
            ),
            Self::Variant(_) => Type::Variant,
        }
    }

    /// Shallow type check used by the encoder before it descends.
    ///
    /// Container members are checked element by element during encoding, not
    /// here.
    #[must_use]
    pub fn matches_type(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Self::Byte(_), Type::Byte)
            | (Self::Boolean(_), Type::Boolean)
            | (Self::Int16(_), Type::Int16)
            | (Self::UInt16(_), Type::UInt16)
            | (Self::Int32(_), Type::Int32)
            | (Self::UInt32(_), Type::UInt32)
            | (Self::Int64(_), Type::Int64)
            | (Self::UInt64(_), Type::UInt64)
            | (Self::Double(_), Type::Double)
            | (Self::String(_), Type::String)
            | (Self::ObjectPath(_), Type::ObjectPath)
            | (Self::Signature(_), Type::Signature)
            | (Self::UnixFd(_), Type::UnixFd)
            | (Self::Variant(_), Type::Variant) => true,
            (Self::Array { elem, .. }, Type::Array(want)) => elem == want.as_ref(),
            (Self::Struct(members), Type::Struct(want)) => members.len() == want.len(),
            (Self::DictEntry(..), Type::DictEntry(..)) => true,
            _ => false,
        }
    }

    /// Convenience constructor for a string array (`as`).
    #[must_use]
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            elem: Type::String,
            items: items.into_iter().map(|s| Self::String(s.into())).collect(),
        }
    }

    /// Returns the inner `&str` for string-family values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the inner u32 for `UInt32` values.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_of_scalars() {
        assert_eq!(Value::Byte(7).type_of(), Type::Byte);
        assert_eq!(Value::Boolean(true).type_of(), Type::Boolean);
        assert_eq!(Value::Double(1.5).type_of(), Type::Double);
        assert_eq!(Value::UnixFd(0).type_of(), Type::UnixFd);
    }

    #[test]
    fn type_of_containers() {
        let arr = Value::Array {
            elem: Type::Int32,
            items: vec![],
        };
        assert_eq!(arr.type_of(), Type::parse("ai").unwrap());

        let st = Value::Struct(vec![Value::Int32(1), Value::String("x".into())]);
        assert_eq!(st.type_of(), Type::parse("(is)").unwrap());

        let var = Value::Variant(Box::new(Value::UInt32(9)));
        assert_eq!(var.type_of(), Type::Variant);
    }

    #[test]
    fn empty_array_keeps_element_type() {
        let arr = Value::Array {
            elem: Type::parse("a{sv}").unwrap(),
            items: vec![],
        };
        assert_eq!(arr.type_of().signature(), "aa{sv}");
    }

    #[test]
    fn shallow_match() {
        let arr = Value::Array {
            elem: Type::String,
            items: vec![],
        };
        assert!(arr.matches_type(&Type::parse("as").unwrap()));
        assert!(!arr.matches_type(&Type::parse("ai").unwrap()));
        assert!(!Value::Int32(1).matches_type(&Type::UInt32));
    }
}
