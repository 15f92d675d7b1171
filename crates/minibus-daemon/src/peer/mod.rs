//! Per-connection peer tasks.
//!
//! Each accepted socket gets one task that owns the transport, the inbound
//! buffer, the inbound descriptor queue, and the handshake machine. After
//! `BEGIN` the task registers with the router and settles into a select loop:
//! inbound bytes are framed into messages (with their descriptors attached)
//! and handed to the router; outbound messages arrive on a bounded queue and
//! are written one at a time, descriptors riding the first write.
//!
//! # Lifecycle
//!
//! ```text
//! accept → handshake (deadline-bound) → PeerUp → select loop → PeerDown
//! ```
//!
//! Termination — socket close, a wire error, cancellation by the router —
//! always funnels into the same exit path, which tells the router to release
//! everything keyed by this peer. No partial teardown.

pub mod credentials;
pub mod transport;

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bytes::BytesMut;
use minibus_core::Message;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::handshake::{Handshake, HandshakeAction};
use crate::peer::transport::PeerTransport;
use crate::router::RouterMsg;

/// Per-message descriptor ceiling, matching reference brokers.
pub const MAX_FDS_PER_MESSAGE: u32 = 16;

/// Opaque peer identity. Unique names are a separate, later concept: a peer
/// id exists from accept time, a unique name only after `Hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Wraps a raw id; the server allocates them monotonically.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// What the router holds for a live peer: the way to reach it and the way to
/// kill it. Identifiers and channels only, never owning references into the
/// peer task's state.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Bounded outbound queue; overflow terminates the peer.
    pub outbound: mpsc::Sender<Arc<Message>>,
    /// Cancels the peer task.
    pub cancel: CancellationToken,
    /// Authenticated uid, for connect-time policy defaults.
    pub uid: Option<u32>,
}

/// Runs one connection to completion. Spawned by the server per accept;
/// `cancel` is a child of the server-wide shutdown token, so both the router
/// (slow consumer) and a broker shutdown can end the task.
pub(crate) async fn run_peer(
    id: PeerId,
    transport: PeerTransport,
    socket_uid: Option<u32>,
    router: mpsc::Sender<RouterMsg>,
    config: Arc<BrokerConfig>,
    cancel: CancellationToken,
) {
    debug!(peer = %id, "connection accepted");

    let mut buf = BytesMut::with_capacity(4096);
    let mut fd_queue: Vec<OwnedFd> = Vec::new();
    let mut handshake = Handshake::new(
        &config.handshake_guid,
        transport.supports_fd_passing(),
        socket_uid,
    );

    let exchange = run_handshake(&transport, &mut buf, &mut fd_queue, &mut handshake);
    let exchange = tokio::time::timeout(config.handshake_timeout, exchange);
    let completed = tokio::select! {
        () = cancel.cancelled() => return,
        result = exchange => match result {
            Ok(Ok(completed)) => completed,
            Ok(Err(err)) => {
                warn!(peer = %id, error = %err, "handshake failed");
                return;
            },
            Err(_) => {
                warn!(peer = %id, "handshake deadline exceeded");
                return;
            },
        },
    };
    if !completed {
        debug!(peer = %id, "peer closed during handshake");
        return;
    }

    let credentials = handshake.credentials().cloned().unwrap_or_default();
    let fd_passing = handshake.fd_passing();
    info!(peer = %id, uid = ?credentials.uid, fd_passing, "peer active");

    let (outbound_tx, mut outbound_rx) = mpsc::channel(config.outbound_queue);
    let handle = PeerHandle {
        outbound: outbound_tx,
        cancel: cancel.clone(),
        uid: credentials.uid,
    };
    if router.send(RouterMsg::PeerUp { id, handle }).await.is_err() {
        return; // broker shutting down before we got started
    }

    let result = main_loop(
        id,
        &transport,
        fd_passing,
        &mut buf,
        &mut fd_queue,
        &mut outbound_rx,
        &router,
        &cancel,
    )
    .await;

    match result {
        Ok(()) => info!(peer = %id, "peer disconnected"),
        Err(err) => warn!(peer = %id, error = %err, "peer terminated"),
    }
    let _ = router.send(RouterMsg::PeerDown { id }).await;
}

/// Drives the line protocol until `BEGIN`. Returns `false` when the peer
/// closed the socket before completing.
async fn run_handshake(
    transport: &PeerTransport,
    buf: &mut BytesMut,
    fd_queue: &mut Vec<OwnedFd>,
    handshake: &mut Handshake,
) -> Result<bool, BrokerError> {
    loop {
        for action in handshake.advance(buf)? {
            match action {
                HandshakeAction::Send(line) => transport.send_all(&line, &[]).await?,
                // fd_passing is read off the machine after completion.
                HandshakeAction::EnableFdPassing | HandshakeAction::Begin => {},
            }
        }
        if handshake.is_active() {
            return Ok(true);
        }
        let n = transport.recv(buf, fd_queue).await?;
        if n == 0 {
            return Ok(false);
        }
    }
}

/// The steady-state select loop: one transport, one bounded outbound queue,
/// one cancellation token.
#[allow(clippy::too_many_arguments)] // all per-connection state, by design local
async fn main_loop(
    id: PeerId,
    transport: &PeerTransport,
    fd_passing: bool,
    buf: &mut BytesMut,
    fd_queue: &mut Vec<OwnedFd>,
    outbound_rx: &mut mpsc::Receiver<Arc<Message>>,
    router: &mpsc::Sender<RouterMsg>,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    let mut codec = MessageCodec::new();

    // Bytes that trailed BEGIN in the handshake buffer may already hold
    // complete messages.
    drain_inbound(id, &mut codec, buf, fd_queue, router).await?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(peer = %id, "peer cancelled");
                return Ok(());
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => write_message(transport, fd_passing, message.as_ref()).await?,
                None => return Ok(()),
            },
            result = transport.recv(buf, fd_queue) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                drain_inbound(id, &mut codec, buf, fd_queue, router).await?;
            },
        }
    }
}

/// Frames every complete message out of `buf` and forwards it to the router.
/// The bounded router channel is the inbound backpressure: while the router
/// is behind, this await parks the peer task and the socket goes unread.
async fn drain_inbound(
    id: PeerId,
    codec: &mut MessageCodec,
    buf: &mut BytesMut,
    fd_queue: &mut Vec<OwnedFd>,
    router: &mpsc::Sender<RouterMsg>,
) -> Result<(), BrokerError> {
    while let Some(mut message) = codec.decode(buf)? {
        attach_fds(&mut message, fd_queue)?;
        router
            .send(RouterMsg::Route { from: id, message })
            .await
            .map_err(|_| BrokerError::RouterGone)?;
    }
    Ok(())
}

/// Moves the first `unix_fds` queued descriptors onto the message they
/// belong to. Descriptors arrive on the same `sendmsg` as (part of) their
/// message's bytes, so by the time the full message is framed they must all
/// be queued; a shortfall is a protocol violation.
fn attach_fds(message: &mut Message, fd_queue: &mut Vec<OwnedFd>) -> Result<(), BrokerError> {
    let declared = message.unix_fds;
    if declared == 0 {
        return Ok(());
    }
    if declared > MAX_FDS_PER_MESSAGE {
        return Err(BrokerError::TooManyFds(declared));
    }
    let count = declared as usize;
    if fd_queue.len() < count {
        return Err(BrokerError::FdCountMismatch {
            declared,
            available: fd_queue.len(),
        });
    }
    message.fds = fd_queue.drain(..count).collect();
    Ok(())
}

/// Writes one message; descriptors ride the first write as ancillary data.
/// On a transport without negotiated descriptor passing they are silently
/// dropped while the declared count stays with the wire bytes.
async fn write_message(
    transport: &PeerTransport,
    fd_passing: bool,
    message: &Message,
) -> Result<(), BrokerError> {
    let mut out = BytesMut::new();
    MessageCodec::new().encode(message, &mut out)?;

    let raw_fds: Vec<RawFd>;
    let fds: &[RawFd] = if fd_passing {
        raw_fds = message.fds.iter().map(AsRawFd::as_raw_fd).collect();
        &raw_fds
    } else {
        if !message.fds.is_empty() {
            debug!(
                count = message.fds.len(),
                "dropping descriptors: fd passing not negotiated"
            );
        }
        &[]
    };

    transport.send_all(&out, fds).await?;
    Ok(())
}
