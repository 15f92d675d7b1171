//! Peer credentials extraction from Unix sockets via `SO_PEERCRED`.

use std::io;

use tokio::net::UnixStream;

/// Kernel-reported credentials of the process on the other end of a Unix
/// socket. These outrank anything the peer claims during `AUTH EXTERNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User ID of the peer process.
    pub uid: u32,
    /// Group ID of the peer process.
    pub gid: u32,
    /// Process ID of the peer process, when the platform reports one.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Extracts credentials from a connected Unix stream.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let creds = stream.peer_cred()?;
        Ok(Self {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        })
    }
}
