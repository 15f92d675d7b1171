//! The line-based authentication handshake.
//!
//! Before any binary framing, a D-Bus connection speaks a SASL-flavored line
//! protocol: the client sends a single NUL byte, then CRLF-terminated
//! commands. The broker supports `EXTERNAL` (identity asserted via the
//! socket's kernel credentials) and `ANONYMOUS`.
//!
//! ```text
//! Client                                Server
//!   |  \0                                 |
//!   |  AUTH EXTERNAL 31303030\r\n  ---->  |
//!   |  <----  OK <server-guid>\r\n        |
//!   |  NEGOTIATE_UNIX_FD\r\n       ---->  |
//!   |  <----  AGREE_UNIX_FD\r\n           |
//!   |  BEGIN\r\n                   ---->  |
//!   |  (binary framing follows)           |
//! ```
//!
//! The machine here is pure: the peer task feeds it the inbound buffer and
//! writes back whatever reply lines it emits. Bytes that follow `BEGIN` in
//! the same read belong to the binary stream and are left in the buffer.
//!
//! # Security Considerations
//!
//! - On Unix sockets the uid claimed via `AUTH EXTERNAL` must equal the
//!   `SO_PEERCRED` uid; a mismatch is rejected, not trusted.
//! - Lines are bounded at [`MAX_LINE_LEN`] so a peer cannot buffer-balloon
//!   the broker before authenticating.
//! - The peer task enforces a wall-clock deadline around the whole exchange.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Upper bound on a single handshake line, terminator included.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Fatal handshake violations. Soft failures (bad mechanism, wrong
/// credentials) get `REJECTED`/`ERROR` replies instead and keep the
/// connection alive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The first byte of the stream was not NUL.
    #[error("first byte of the connection must be NUL")]
    MissingNulByte,

    /// A line exceeded [`MAX_LINE_LEN`] without a terminator.
    #[error("handshake line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    /// A command line was not valid UTF-8.
    #[error("handshake line is not valid UTF-8")]
    InvalidUtf8,
}

/// Credentials established by the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthCredentials {
    /// Authenticated user id; `None` after `ANONYMOUS`.
    pub uid: Option<u32>,
}

/// What the peer task must do after feeding the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Write this line (terminator included) to the peer.
    Send(Vec<u8>),
    /// The peer agreed to descriptor passing; flag the transport.
    EnableFdPassing,
    /// The handshake finished; remaining buffered bytes are binary framing.
    Begin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Awaiting the leading NUL byte.
    Start,
    /// Awaiting a successful `AUTH`.
    AwaitAuth,
    /// Authenticated; awaiting `BEGIN` or `NEGOTIATE_UNIX_FD`.
    AwaitBegin,
    /// Binary mode; the machine is done.
    Active,
}

/// One handshake state machine per connection.
#[derive(Debug)]
pub struct Handshake {
    state: State,
    /// Hex GUID echoed in `OK`.
    server_guid: String,
    /// Whether the transport can carry descriptors at all.
    fd_passing_supported: bool,
    /// Kernel-reported uid, when the transport has one.
    socket_uid: Option<u32>,
    credentials: Option<AuthCredentials>,
    fd_passing: bool,
}

impl Handshake {
    /// Creates a machine for one connection.
    ///
    /// `socket_uid` is the `SO_PEERCRED` uid on Unix sockets and `None` on
    /// the TCP debug transport.
    #[must_use]
    pub fn new(
        server_guid: impl Into<String>,
        fd_passing_supported: bool,
        socket_uid: Option<u32>,
    ) -> Self {
        Self {
            state: State::Start,
            server_guid: server_guid.into(),
            fd_passing_supported,
            socket_uid,
            credentials: None,
            fd_passing: false,
        }
    }

    /// `true` once `BEGIN` was processed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// Credentials established by `AUTH`, once past that stage.
    #[must_use]
    pub fn credentials(&self) -> Option<&AuthCredentials> {
        self.credentials.as_ref()
    }

    /// `true` when `NEGOTIATE_UNIX_FD` was agreed.
    #[must_use]
    pub fn fd_passing(&self) -> bool {
        self.fd_passing
    }

    /// Feeds buffered bytes to the machine.
    ///
    /// Consumes complete lines from `buf` and returns the actions they
    /// produced. Returns early after `Begin`, leaving any trailing bytes in
    /// `buf` for the framer. A partial trailing line stays buffered.
    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let mut actions = Vec::new();

        if self.state == State::Start {
            let Some(&first) = buf.first() else {
                return Ok(actions);
            };
            if first != 0 {
                return Err(HandshakeError::MissingNulByte);
            }
            buf.advance(1);
            self.state = State::AwaitAuth;
        }

        while self.state != State::Active {
            let Some(line) = take_line(buf)? else {
                return Ok(actions);
            };
            self.process_line(&line, &mut actions);
            if self.state == State::Active {
                actions.push(HandshakeAction::Begin);
                break;
            }
        }

        Ok(actions)
    }

    fn process_line(&mut self, line: &str, actions: &mut Vec<HandshakeAction>) {
        let mut tokens = line.split_ascii_whitespace();
        let command = tokens.next().unwrap_or("");

        match (self.state, command) {
            (State::AwaitAuth, "AUTH") => {
                let mechanism = tokens.next().unwrap_or("");
                let argument = tokens.next();
                match self.authenticate(mechanism, argument) {
                    Some(credentials) => {
                        self.credentials = Some(credentials);
                        self.state = State::AwaitBegin;
                        actions.push(send(format!("OK {}", self.server_guid)));
                    },
                    None => actions.push(send("REJECTED EXTERNAL ANONYMOUS")),
                }
            },
            (State::AwaitBegin, "NEGOTIATE_UNIX_FD") => {
                if self.fd_passing_supported {
                    self.fd_passing = true;
                    actions.push(HandshakeAction::EnableFdPassing);
                    actions.push(send("AGREE_UNIX_FD"));
                } else {
                    actions.push(send("ERROR"));
                }
            },
            (State::AwaitBegin, "BEGIN") => {
                self.state = State::Active;
            },
            (State::AwaitBegin, "CANCEL") => {
                // SASL allows backing out of a completed AUTH before BEGIN.
                self.credentials = None;
                self.state = State::AwaitAuth;
                actions.push(send("REJECTED EXTERNAL ANONYMOUS"));
            },
            _ => actions.push(send("ERROR")),
        }
    }

    /// Returns credentials on success, `None` to reject.
    fn authenticate(&self, mechanism: &str, argument: Option<&str>) -> Option<AuthCredentials> {
        match mechanism {
            "EXTERNAL" => {
                let claimed = parse_hex_uid(argument?)?;
                // Kernel credentials outrank the claim when we have them.
                if let Some(actual) = self.socket_uid {
                    if claimed != actual {
                        return None;
                    }
                }
                Some(AuthCredentials { uid: Some(claimed) })
            },
            // The optional trace argument is ignored.
            "ANONYMOUS" => Some(AuthCredentials { uid: None }),
            _ => None,
        }
    }
}

fn send(line: impl Into<String>) -> HandshakeAction {
    let mut bytes = line.into().into_bytes();
    bytes.extend_from_slice(b"\r\n");
    HandshakeAction::Send(bytes)
}

/// Removes one CRLF-terminated line from the buffer, if present.
fn take_line(buf: &mut BytesMut) -> Result<Option<String>, HandshakeError> {
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > MAX_LINE_LEN {
            return Err(HandshakeError::LineTooLong);
        }
        return Ok(None);
    };
    if end > MAX_LINE_LEN {
        return Err(HandshakeError::LineTooLong);
    }
    let line = buf.split_to(end + 2);
    std::str::from_utf8(&line[..end])
        .map(|s| Some(s.to_owned()))
        .map_err(|_| HandshakeError::InvalidUtf8)
}

/// Decodes the hex-encoded ASCII uid of `AUTH EXTERNAL`.
fn parse_hex_uid(hex: &str) -> Option<u32> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    let mut ascii = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        #[allow(clippy::cast_possible_truncation)] // two hex digits
        ascii.push((hi * 16 + lo) as u8);
    }
    std::str::from_utf8(&ascii).ok()?.parse().ok()
}
