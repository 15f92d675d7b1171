//! Alignment-sensitive value encoding and decoding.
//!
//! Every D-Bus value is padded to its type's alignment *relative to the start
//! of the message*, not to the start of its enclosing container. Both the
//! [`Encoder`] and the [`Decoder`] therefore thread one absolute offset: for
//! the encoder it is simply the length of the output buffer, for the decoder
//! it is the cursor into the input slice. Resetting the offset per container
//! is the classic way to get this codec wrong; nothing here ever does.
//!
//! Decoding is incremental: a buffer that ends before the next needed span
//! yields [`WireError::InsufficientData`], which callers treat as "read more
//! bytes and retry", never as a protocol violation.

use crate::error::WireError;
use crate::names::is_valid_object_path;
use crate::signature::{MAX_SIGNATURE_LEN, Type};
use crate::value::Value;

/// Maximum array length in bytes (2^26, from the D-Bus specification).
pub const MAX_ARRAY_LEN: u32 = 1 << 26;

/// Maximum nesting depth while decoding, including variant descent.
///
/// Signature parsing already bounds a single signature at 32 containers, but
/// variants open fresh signatures, so the decoder carries its own counter.
const MAX_DECODE_DEPTH: usize = 64;

/// Byte order of a message, taken from the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// `l` — least significant byte first. The default on every platform we
    /// serve, and what the broker emits for its own messages.
    #[default]
    Little,
    /// `B` — most significant byte first.
    Big,
}

impl Endian {
    /// The wire marker byte.
    #[must_use]
    pub const fn marker(self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    /// Parses a wire marker byte.
    pub const fn from_marker(marker: u8) -> Result<Self, WireError> {
        match marker {
            b'l' => Ok(Self::Little),
            b'B' => Ok(Self::Big),
            other => Err(WireError::UnknownEndianness(other)),
        }
    }
}

/// Encodes values into a growing buffer at a running absolute offset.
///
/// The buffer is assumed to begin at message offset 0; callers that encode a
/// body after a header simply keep using the same buffer.
#[derive(Debug)]
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
    endian: Endian,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder appending to `buf`.
    pub fn new(buf: &'a mut Vec<u8>, endian: Endian) -> Self {
        Self { buf, endian }
    }

    /// Current absolute offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// Writes zero padding up to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let target = self.buf.len().next_multiple_of(align);
        self.buf.resize(target, 0);
    }

    /// Encodes one value as `ty`, padding first.
    ///
    /// # Errors
    ///
    /// [`WireError::TypeMismatch`] when the value does not match `ty`, plus
    /// the string/path/signature validity errors.
    pub fn encode_value(&mut self, value: &Value, ty: &Type) -> Result<(), WireError> {
        if !value.matches_type(ty) {
            return Err(WireError::TypeMismatch {
                value: value.type_of().signature(),
                expected: ty.signature(),
            });
        }
        self.pad_to(ty.alignment());

        match (value, ty) {
            (Value::Byte(v), _) => self.buf.push(*v),
            (Value::Boolean(v), _) => self.put_u32(u32::from(*v)),
            (Value::Int16(v), _) => self.put_bytes(v.to_le_bytes(), v.to_be_bytes()),
            (Value::UInt16(v), _) => self.put_bytes(v.to_le_bytes(), v.to_be_bytes()),
            (Value::Int32(v), _) => self.put_bytes(v.to_le_bytes(), v.to_be_bytes()),
            (Value::UInt32(v) | Value::UnixFd(v), _) => self.put_u32(*v),
            (Value::Int64(v), _) => self.put_bytes(v.to_le_bytes(), v.to_be_bytes()),
            (Value::UInt64(v), _) => self.put_bytes(v.to_le_bytes(), v.to_be_bytes()),
            (Value::Double(v), _) => {
                let bits = v.to_bits();
                self.put_bytes(bits.to_le_bytes(), bits.to_be_bytes());
            },
            (Value::String(s), _) => self.put_long_string(s)?,
            (Value::ObjectPath(p), _) => {
                if !is_valid_object_path(p) {
                    return Err(WireError::InvalidObjectPath(p.clone()));
                }
                self.put_long_string(p)?;
            },
            (Value::Signature(s), _) => self.put_signature_string(s)?,
            (Value::Array { elem, items }, _) => self.encode_array(elem, items)?,
            (Value::Struct(members), Type::Struct(member_types)) => {
                // pad_to(8) already happened; members at natural alignment.
                for (member, member_ty) in members.iter().zip(member_types) {
                    self.encode_value(member, member_ty)?;
                }
            },
            (Value::DictEntry(key, val), Type::DictEntry(key_ty, val_ty)) => {
                self.encode_value(key, key_ty)?;
                self.encode_value(val, val_ty)?;
            },
            (Value::Variant(inner), _) => {
                let inner_ty = inner.type_of();
                self.put_signature_string(&inner_ty.signature())?;
                self.encode_value(inner, &inner_ty)?;
            },
            _ => unreachable!("matches_type admitted an impossible pairing"),
        }
        Ok(())
    }

    /// Encodes a value sequence against a type sequence.
    pub fn encode_values(&mut self, values: &[Value], types: &[Type]) -> Result<(), WireError> {
        if values.len() != types.len() {
            return Err(WireError::TypeMismatch {
                value: Type::signature_of(
                    &values.iter().map(Value::type_of).collect::<Vec<_>>(),
                ),
                expected: Type::signature_of(types),
            });
        }
        for (value, ty) in values.iter().zip(types) {
            self.encode_value(value, ty)?;
        }
        Ok(())
    }

    fn encode_array(&mut self, elem: &Type, items: &[Value]) -> Result<(), WireError> {
        // Length prefix is patched after the elements are written. Padding to
        // the element alignment happens after the prefix and is not counted
        // in the declared length.
        let len_at = self.buf.len();
        self.put_u32(0);
        self.pad_to(elem.alignment());
        let start = self.buf.len();
        for item in items {
            self.encode_value(item, elem)?;
        }
        let len = self.buf.len() - start;
        let len = u32::try_from(len).map_err(|_| WireError::ArrayTooLong(u32::MAX))?;
        if len > MAX_ARRAY_LEN {
            return Err(WireError::ArrayTooLong(len));
        }
        let bytes = match self.endian {
            Endian::Little => len.to_le_bytes(),
            Endian::Big => len.to_be_bytes(),
        };
        self.buf[len_at..len_at + 4].copy_from_slice(&bytes);
        Ok(())
    }

    fn put_u32(&mut self, v: u32) {
        self.put_bytes(v.to_le_bytes(), v.to_be_bytes());
    }

    fn put_bytes<const N: usize>(&mut self, le: [u8; N], be: [u8; N]) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&le),
            Endian::Big => self.buf.extend_from_slice(&be),
        }
    }

    /// u32-length-prefixed, NUL-terminated string (string, object path).
    fn put_long_string(&mut self, s: &str) -> Result<(), WireError> {
        if s.as_bytes().contains(&0) {
            return Err(WireError::MissingNulTerminator);
        }
        let len = u32::try_from(s.len()).map_err(|_| WireError::ArrayTooLong(u32::MAX))?;
        self.put_u32(len);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// u8-length-prefixed, NUL-terminated signature string.
    fn put_signature_string(&mut self, s: &str) -> Result<(), WireError> {
        Type::parse_many(s)?;
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(WireError::InvalidSignature(
                crate::signature::SignatureError::TooLong,
            ));
        }
        #[allow(clippy::cast_possible_truncation)] // bounded above
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }
}

/// Decodes values from a byte slice at a running absolute offset.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `data`, with `pos` as the absolute offset of
    /// `data[0]` within the message. For whole-message decoding `pos` is 0.
    #[must_use]
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
            depth: 0,
        }
    }

    /// Creates a decoder whose cursor starts at `pos`.
    #[must_use]
    pub fn with_offset(data: &'a [u8], pos: usize, endian: Endian) -> Self {
        Self {
            data,
            pos,
            endian,
            depth: 0,
        }
    }

    /// Current absolute offset.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.pos
    }

    /// Consumes padding up to the next multiple of `align`.
    pub fn consume_pad(&mut self, align: usize) -> Result<(), WireError> {
        let target = self.pos.next_multiple_of(align);
        if target > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: target - self.data.len(),
            });
        }
        self.pos = target;
        Ok(())
    }

    /// Decodes one value of type `ty`, consuming padding first.
    pub fn decode_value(&mut self, ty: &Type) -> Result<Value, WireError> {
        self.consume_pad(ty.alignment())?;
        match ty {
            Type::Byte => Ok(Value::Byte(self.take::<1>()?[0])),
            Type::Boolean => match self.read_u32()? {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                other => Err(WireError::InvalidBoolean(other)),
            },
            Type::Int16 => {
                let b = self.take::<2>()?;
                Ok(Value::Int16(self.from_bytes(b, i16::from_le_bytes, i16::from_be_bytes)))
            },
            Type::UInt16 => {
                let b = self.take::<2>()?;
                Ok(Value::UInt16(self.from_bytes(b, u16::from_le_bytes, u16::from_be_bytes)))
            },
            Type::Int32 => {
                let b = self.take::<4>()?;
                Ok(Value::Int32(self.from_bytes(b, i32::from_le_bytes, i32::from_be_bytes)))
            },
            Type::UInt32 => Ok(Value::UInt32(self.read_u32()?)),
            Type::Int64 => {
                let b = self.take::<8>()?;
                Ok(Value::Int64(self.from_bytes(b, i64::from_le_bytes, i64::from_be_bytes)))
            },
            Type::UInt64 => {
                let b = self.take::<8>()?;
                Ok(Value::UInt64(self.from_bytes(b, u64::from_le_bytes, u64::from_be_bytes)))
            },
            Type::Double => {
                let b = self.take::<8>()?;
                let bits = self.from_bytes(b, u64::from_le_bytes, u64::from_be_bytes);
                Ok(Value::Double(f64::from_bits(bits)))
            },
            Type::String => Ok(Value::String(self.read_long_string()?)),
            Type::ObjectPath => {
                let path = self.read_long_string()?;
                if !is_valid_object_path(&path) {
                    return Err(WireError::InvalidObjectPath(path));
                }
                Ok(Value::ObjectPath(path))
            },
            Type::Signature => {
                let sig = self.read_signature_string()?;
                Type::parse_many(&sig)?;
                Ok(Value::Signature(sig))
            },
            Type::UnixFd => Ok(Value::UnixFd(self.read_u32()?)),
            Type::Array(elem) => self.decode_array(elem),
            Type::Struct(members) => {
                self.descend()?;
                let mut values = Vec::with_capacity(members.len());
                for member in members {
                    values.push(self.decode_value(member)?);
                }
                self.depth -= 1;
                Ok(Value::Struct(values))
            },
            Type::DictEntry(key, value) => {
                self.descend()?;
                let k = self.decode_value(key)?;
                let v = self.decode_value(value)?;
                self.depth -= 1;
                Ok(Value::DictEntry(Box::new(k), Box::new(v)))
            },
            Type::Variant => {
                self.descend()?;
                let sig = self.read_signature_string()?;
                let inner_ty = Type::parse(&sig)?;
                let inner = self.decode_value(&inner_ty)?;
                self.depth -= 1;
                Ok(Value::Variant(Box::new(inner)))
            },
        }
    }

    /// Decodes a value sequence for a body signature.
    pub fn decode_values(&mut self, types: &[Type]) -> Result<Vec<Value>, WireError> {
        let mut values = Vec::with_capacity(types.len());
        for ty in types {
            values.push(self.decode_value(ty)?);
        }
        Ok(values)
    }

    fn decode_array(&mut self, elem: &Type) -> Result<Value, WireError> {
        self.descend()?;
        let len = self.read_u32()?;
        if len > MAX_ARRAY_LEN {
            return Err(WireError::ArrayTooLong(len));
        }
        self.consume_pad(elem.alignment())?;
        let end = self.pos + len as usize;
        if end > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: end - self.data.len(),
            });
        }
        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.decode_value(elem)?);
            if self.pos > end {
                return Err(WireError::ArrayLengthMismatch);
            }
        }
        self.depth -= 1;
        Ok(Value::Array {
            elem: elem.clone(),
            items,
        })
    }

    fn descend(&mut self) -> Result<(), WireError> {
        self.depth += 1;
        if self.depth > MAX_DECODE_DEPTH {
            return Err(WireError::InvalidSignature(
                crate::signature::SignatureError::TooDeep,
            ));
        }
        Ok(())
    }

    /// Reads an endian-sensitive u32 without padding.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take::<4>()?;
        Ok(self.from_bytes(b, u32::from_le_bytes, u32::from_be_bytes))
    }

    /// Reads a single byte without padding.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        if end > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: end - self.data.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn take_slice(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: end - self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn from_bytes<T, const N: usize>(
        &self,
        bytes: [u8; N],
        le: fn([u8; N]) -> T,
        be: fn([u8; N]) -> T,
    ) -> T {
        match self.endian {
            Endian::Little => le(bytes),
            Endian::Big => be(bytes),
        }
    }

    fn read_long_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        let raw = self.take_slice(len + 1)?;
        if raw[len] != 0 {
            return Err(WireError::MissingNulTerminator);
        }
        let body = &raw[..len];
        if body.contains(&0) {
            return Err(WireError::MissingNulTerminator);
        }
        std::str::from_utf8(body)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    fn read_signature_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u8()? as usize;
        let raw = self.take_slice(len + 1)?;
        if raw[len] != 0 {
            return Err(WireError::MissingNulTerminator);
        }
        std::str::from_utf8(&raw[..len])
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }
}
