//! Per-connection transports.
//!
//! The Unix transport wraps a nonblocking socket in [`AsyncFd`] and does its
//! own `recvmsg`/`sendmsg` so it can carry `SCM_RIGHTS` descriptors on the
//! same system call as the bytes they belong to. The TCP transport exists
//! for remote debugging only and never carries descriptors.
//!
//! Both expose readiness-based `&self` methods, which lets one peer task
//! `select!` between reading and writing on the same transport object.

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use bytes::BytesMut;
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;

/// Read chunk size per `recvmsg`/`try_read` call.
const READ_CHUNK: usize = 16 * 1024;

/// Ancillary capacity per read; more descriptors than this in one bundle is
/// a protocol violation upstream anyway.
const FDS_PER_READ: usize = 32;

/// One connection's byte (and descriptor) pipe.
#[derive(Debug)]
pub enum PeerTransport {
    /// Local stream socket; carries descriptors when negotiated.
    Unix(AsyncFd<StdUnixStream>),
    /// Debug transport; bytes only.
    Tcp(TcpStream),
}

impl PeerTransport {
    /// Wraps an accepted Unix socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be switched to nonblocking mode or
    /// registered with the reactor.
    pub fn unix(stream: StdUnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::Unix(AsyncFd::new(stream)?))
    }

    /// Wraps an accepted TCP socket.
    #[must_use]
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }

    /// `true` when the transport can carry descriptors at all.
    #[must_use]
    pub const fn supports_fd_passing(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// Reads once, appending bytes to `buf` and any received descriptors to
    /// `fds`. Returns the byte count; 0 means the peer closed the stream.
    pub async fn recv(
        &self,
        buf: &mut BytesMut,
        fds: &mut Vec<OwnedFd>,
    ) -> io::Result<usize> {
        match self {
            Self::Unix(fd) => loop {
                let mut guard = fd.readable().await?;
                match guard.try_io(|inner| recv_with_fds(inner.get_ref(), buf, fds)) {
                    Ok(result) => return result,
                    Err(_would_block) => {},
                }
            },
            Self::Tcp(stream) => loop {
                stream.readable().await?;
                match stream.try_read_buf(buf) {
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {},
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Writes all of `bytes`, attaching `fds` as ancillary data on the first
    /// `sendmsg` of the batch. On TCP, `fds` must be empty (the peer task
    /// drops descriptors before getting here).
    pub async fn send_all(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let mut offset = 0;
        let mut fds_pending = !fds.is_empty();

        while offset < bytes.len() {
            let n = match self {
                Self::Unix(fd) => loop {
                    let mut guard = fd.writable().await?;
                    let attach: &[RawFd] = if fds_pending { fds } else { &[] };
                    match guard.try_io(|inner| {
                        send_with_fds(inner.get_ref(), &bytes[offset..], attach)
                    }) {
                        Ok(result) => break result?,
                        Err(_would_block) => {},
                    }
                },
                Self::Tcp(stream) => loop {
                    debug_assert!(fds.is_empty(), "descriptors on a TCP transport");
                    stream.writable().await?;
                    match stream.try_write(&bytes[offset..]) {
                        Ok(n) => break n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {},
                        Err(e) => return Err(e),
                    }
                },
            };
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ));
            }
            offset += n;
            fds_pending = false;
        }
        Ok(())
    }
}

fn recv_with_fds(
    stream: &StdUnixStream,
    buf: &mut BytesMut,
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut iov = [IoSliceMut::new(&mut chunk)];
    let mut cmsg = cmsg_space!([RawFd; FDS_PER_READ]);

    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    for control in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = control {
            for fd in received {
                // SAFETY: the kernel just handed us ownership of this fd.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    let n = msg.bytes;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn send_with_fds(stream: &StdUnixStream, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let control = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &control };

    sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)
}
