//! Message framing: fixed header, header-field array, aligned body.
//!
//! Wire layout:
//!
//! ```text
//! +---+---+---+---+------------+------------+----------------+-----+------+
//! | e | k | f | v | body len   | serial     | fields a(yv)   | pad | body |
//! +---+---+---+---+------------+------------+----------------+-----+------+
//!   0   1   2   3   4..8 (u32)   8..12 (u32)  12..            to 8
//! ```
//!
//! `e` is the endianness marker, `k` the kind, `f` the flags, `v` the
//! protocol version (always 1). The body begins at the first 8-byte boundary
//! after the field array and is exactly `body len` bytes.
//!
//! The framer is pure: [`decode_message`] borrows a byte slice and returns
//! `Ok(None)` until the slice holds one complete message, then the message
//! plus the number of bytes consumed. Buffer ownership stays with the caller.
//! Declared sizes are validated against [`MAX_MESSAGE_SIZE`] BEFORE the
//! caller is asked to buffer more, so a hostile length prefix cannot balloon
//! memory.

use crate::codec::{Decoder, Encoder, Endian, MAX_ARRAY_LEN};
use crate::error::WireError;
use crate::message::{field_code, HeaderFlags, Message, MessageError, MessageKind};
use crate::signature::Type;
use crate::value::Value;

/// Hard ceiling on a single message, header and body together (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Offset of the header-field array within a message.
const FIELDS_OFFSET: usize = 12;

/// Wire protocol major version.
const PROTOCOL_VERSION: u8 = 1;

fn fields_array_type() -> Type {
    Type::Array(Box::new(Type::Struct(vec![Type::Byte, Type::Variant])))
}

/// Encodes a message to wire bytes in little-endian order.
///
/// # Errors
///
/// Fails on a zero serial, missing required header fields, a body that does
/// not encode, or a result exceeding [`MAX_MESSAGE_SIZE`].
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    encode_message_endian(message, Endian::Little)
}

/// Encodes a message with an explicit byte order.
pub fn encode_message_endian(
    message: &Message,
    endian: Endian,
) -> Result<Vec<u8>, WireError> {
    message.validate().map_err(map_message_error)?;
    if message.serial == 0 {
        return Err(WireError::InvalidSerial);
    }

    let mut buf = Vec::with_capacity(256);
    buf.push(endian.marker());
    buf.push(message.kind().to_wire());
    buf.push(message.flags.0);
    buf.push(PROTOCOL_VERSION);

    let mut enc = Encoder::new(&mut buf, endian);
    enc.encode_value(&Value::UInt32(0), &Type::UInt32)?; // body length, patched below
    enc.encode_value(&Value::UInt32(message.serial), &Type::UInt32)?;

    let fields = header_fields(message);
    enc.encode_value(&fields, &fields_array_type())?;
    enc.pad_to(8);

    let body_start = buf.len();
    let body_types: Vec<Type> = message.body.iter().map(Value::type_of).collect();
    let mut enc = Encoder::new(&mut buf, endian);
    enc.encode_values(&message.body, &body_types)?;

    let body_len = buf.len() - body_start;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: buf.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_MESSAGE_SIZE
    let body_len = body_len as u32;
    let len_bytes = match endian {
        Endian::Little => body_len.to_le_bytes(),
        Endian::Big => body_len.to_be_bytes(),
    };
    buf[4..8].copy_from_slice(&len_bytes);
    Ok(buf)
}

/// Decodes one message from the front of `data`.
///
/// Returns `Ok(None)` while `data` is shorter than one complete message,
/// otherwise the message and the number of bytes it occupied. Attached
/// descriptors are the caller's concern; the returned message has an empty
/// descriptor list and carries only the declared `unix_fds` count.
pub fn decode_message(data: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
    if data.len() < FIELDS_OFFSET + 4 {
        return Ok(None);
    }

    let endian = Endian::from_marker(data[0])?;
    let kind = MessageKind::from_wire(data[1]).ok_or(WireError::InvalidMessageKind(data[1]))?;
    let flags = HeaderFlags(data[2]);
    if data[3] != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedProtocolVersion(data[3]));
    }

    let mut fixed = Decoder::with_offset(data, 4, endian);
    let body_len = fixed.read_u32()? as usize;
    let serial = fixed.read_u32()?;
    if serial == 0 {
        return Err(WireError::InvalidSerial);
    }
    let fields_len = fixed.read_u32()?;
    if fields_len > MAX_ARRAY_LEN {
        return Err(WireError::ArrayTooLong(fields_len));
    }

    let header_end = FIELDS_OFFSET + 4 + fields_len as usize;
    let body_start = header_end.next_multiple_of(8);
    let total = body_start + body_len;
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: total,
            limit: MAX_MESSAGE_SIZE,
        });
    }
    if data.len() < total {
        return Ok(None);
    }

    let mut message = Message {
        kind: Some(kind),
        serial,
        flags,
        ..Message::default()
    };

    let mut dec = Decoder::with_offset(&data[..header_end], FIELDS_OFFSET, endian);
    let fields = dec.decode_value(&fields_array_type())?;
    let Value::Array { items, .. } = fields else {
        unreachable!("decode_value returned a non-array for an array type");
    };
    for entry in items {
        let Value::Struct(mut members) = entry else {
            unreachable!("field entry is always a struct");
        };
        let variant = members.pop();
        let code = members.pop();
        let (Some(Value::Byte(code)), Some(Value::Variant(inner))) = (code, variant) else {
            unreachable!("field entry is always (byte, variant)");
        };
        apply_header_field(&mut message, code, *inner)?;
    }

    let signature = message.signature.clone().unwrap_or_default();
    let body_types = Type::parse_many(&signature)?;
    let mut dec = Decoder::with_offset(&data[..total], body_start, endian);
    message.body = dec.decode_values(&body_types)?;
    let decoded = dec.offset() - body_start;
    if decoded != body_len {
        #[allow(clippy::cast_possible_truncation)] // both bounded by MAX_MESSAGE_SIZE
        return Err(WireError::BodyLengthMismatch {
            declared: body_len as u32,
            decoded: decoded as u32,
        });
    }

    message.validate().map_err(map_message_error)?;
    Ok(Some((message, total)))
}

/// Applies one decoded header field to the message under construction.
///
/// Unknown field codes are skipped for forward compatibility; known codes
/// holding the wrong variant type are wire errors.
fn apply_header_field(message: &mut Message, code: u8, value: Value) -> Result<(), WireError> {
    let wrong_type = WireError::InvalidHeaderField { code };
    match code {
        field_code::PATH => match value {
            Value::ObjectPath(path) => message.path = Some(path),
            _ => return Err(wrong_type),
        },
        field_code::INTERFACE => match value {
            Value::String(s) => message.interface = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::MEMBER => match value {
            Value::String(s) => message.member = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::ERROR_NAME => match value {
            Value::String(s) => message.error_name = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::REPLY_SERIAL => match value {
            Value::UInt32(serial) => message.reply_serial = Some(serial),
            _ => return Err(wrong_type),
        },
        field_code::DESTINATION => match value {
            Value::String(s) => message.destination = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::SENDER => match value {
            Value::String(s) => message.sender = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::SIGNATURE => match value {
            Value::Signature(s) => message.signature = Some(s),
            _ => return Err(wrong_type),
        },
        field_code::UNIX_FDS => match value {
            Value::UInt32(count) => message.unix_fds = count,
            _ => return Err(wrong_type),
        },
        _ => {}, // forward compatibility: ignore unknown codes
    }
    Ok(())
}

fn header_fields(message: &Message) -> Value {
    let mut items = Vec::new();
    let mut push = |code: u8, value: Value| {
        items.push(Value::Struct(vec![
            Value::Byte(code),
            Value::Variant(Box::new(value)),
        ]));
    };

    if let Some(path) = &message.path {
        push(field_code::PATH, Value::ObjectPath(path.clone()));
    }
    if let Some(interface) = &message.interface {
        push(field_code::INTERFACE, Value::String(interface.clone()));
    }
    if let Some(member) = &message.member {
        push(field_code::MEMBER, Value::String(member.clone()));
    }
    if let Some(error_name) = &message.error_name {
        push(field_code::ERROR_NAME, Value::String(error_name.clone()));
    }
    if let Some(reply_serial) = message.reply_serial {
        push(field_code::REPLY_SERIAL, Value::UInt32(reply_serial));
    }
    if let Some(destination) = &message.destination {
        push(field_code::DESTINATION, Value::String(destination.clone()));
    }
    if let Some(sender) = &message.sender {
        push(field_code::SENDER, Value::String(sender.clone()));
    }
    let signature = message.body_signature();
    if !signature.is_empty() {
        push(field_code::SIGNATURE, Value::Signature(signature));
    }
    if message.unix_fds > 0 {
        push(field_code::UNIX_FDS, Value::UInt32(message.unix_fds));
    }

    Value::Array {
        elem: Type::Struct(vec![Type::Byte, Type::Variant]),
        items,
    }
}

fn map_message_error(err: MessageError) -> WireError {
    match err {
        MessageError::MissingField { field, .. } => WireError::MissingHeaderField(field),
    }
}
