//! Name and path grammar validation.
//!
//! The broker validates every name a client hands it: bus names on
//! `RequestName` and `GetNameOwner`, interface and member names on message
//! headers, object paths everywhere a path appears. All grammars come from
//! the D-Bus specification; every name is capped at [`MAX_NAME_LEN`] bytes.

/// Maximum length of any name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// The reserved name of the message bus itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// The object path of the message bus object.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Validates an object path: `/` or `/seg(/seg)*` with segments over
/// `[A-Za-z0-9_]`.
#[must_use]
pub fn is_valid_object_path(path: &str) -> bool {
    if path.is_empty() || path.len() > MAX_NAME_LEN {
        return false;
    }
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/')
        .all(|seg| !seg.is_empty() && seg.bytes().all(is_path_byte))
}

const fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Validates a unique connection name of the form `:1.N` (more generally,
/// `:` followed by at least two dot-separated non-empty segments over
/// `[A-Za-z0-9_-]`).
#[must_use]
pub fn is_valid_unique_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    let mut segments = 0;
    for seg in rest.split('.') {
        if seg.is_empty() || !seg.bytes().all(|b| is_name_byte(b) || b.is_ascii_digit()) {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Validates a well-known bus name: two or more dot-separated segments over
/// `[A-Za-z0-9_-]`, no segment starting with a digit, no leading colon.
#[must_use]
pub fn is_valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return false;
    }
    let mut segments = 0;
    for seg in name.split('.') {
        if seg.is_empty()
            || seg.as_bytes()[0].is_ascii_digit()
            || !seg.bytes().all(is_name_byte)
        {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

const fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Validates either form of bus name.
#[must_use]
pub fn is_valid_bus_name(name: &str) -> bool {
    is_valid_unique_name(name) || is_valid_well_known_name(name)
}

/// Validates an interface name: two or more dot-separated segments over
/// `[A-Za-z0-9_]`, no segment starting with a digit.
#[must_use]
pub fn is_valid_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut segments = 0;
    for seg in name.split('.') {
        if seg.is_empty()
            || seg.as_bytes()[0].is_ascii_digit()
            || !seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Error names share the interface grammar.
#[must_use]
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// Validates a member (method or signal) name: one segment over
/// `[A-Za-z0-9_]`, not starting with a digit.
#[must_use]
pub fn is_valid_member_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let bytes = name.as_bytes();
    !bytes[0].is_ascii_digit()
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}
