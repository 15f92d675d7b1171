//! The listening endpoints and accept loop.
//!
//! One Unix listener (always) and one TCP listener (debug only, when
//! configured). Each accepted connection gets a fresh [`PeerId`] and its own
//! task; a semaphore bounds how many are alive at once.
//!
//! # Socket hygiene
//!
//! The socket's parent directory is created with mode 0700, a stale socket
//! file is unlinked before binding, and a path that exists but is not a
//! socket aborts startup instead of being deleted.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::peer::credentials::PeerCredentials;
use crate::peer::transport::PeerTransport;
use crate::peer::{run_peer, PeerId};
use crate::router::RouterMsg;

/// The broker's listening side.
#[derive(Debug)]
pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    unix: UnixListener,
    tcp: Option<TcpListener>,
    router_tx: mpsc::Sender<RouterMsg>,
    connection_sem: Arc<Semaphore>,
    next_peer_id: AtomicU64,
}

impl BrokerServer {
    /// Binds the configured endpoints.
    ///
    /// # Errors
    ///
    /// Fails when the socket directory cannot be prepared, a non-socket file
    /// occupies the socket path, or either bind fails.
    pub async fn bind(
        config: Arc<BrokerConfig>,
        router_tx: mpsc::Sender<RouterMsg>,
    ) -> io::Result<Self> {
        if let Some(parent) = config.socket_path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_stale_socket(&config.socket_path)?;

        let unix = UnixListener::bind(&config.socket_path)?;
        info!(socket = %config.socket_path.display(), "listening on unix socket");

        let tcp = match config.tcp_listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                warn!(%addr, "debug TCP endpoint enabled; it carries no credentials");
                Some(listener)
            },
            None => None,
        };

        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            config,
            unix,
            tcp,
            router_tx,
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Accepts connections until `shutdown` fires, then unlinks the socket.
    /// Peer tasks run under child tokens of `shutdown`, so cancelling it
    /// also winds down every live connection.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.unix.accept() => match result {
                    Ok((stream, _addr)) => self.spawn_unix_peer(stream, shutdown.child_token()),
                    Err(err) => warn!(error = %err, "unix accept failed"),
                },
                result = accept_tcp(self.tcp.as_ref()) => match result {
                    Ok(stream) => self.spawn_tcp_peer(stream, shutdown.child_token()),
                    Err(err) => warn!(error = %err, "tcp accept failed"),
                },
            }
        }

        info!("listener stopped");
        let _ = std::fs::remove_file(&self.config.socket_path);
    }

    fn spawn_unix_peer(&self, stream: UnixStream, cancel: CancellationToken) {
        let Ok(permit) = self.connection_sem.clone().try_acquire_owned() else {
            warn!("connection limit reached, refusing peer");
            return;
        };

        let credentials = match PeerCredentials::from_stream(&stream) {
            Ok(creds) => Some(creds),
            Err(err) => {
                debug!(error = %err, "could not read peer credentials");
                None
            },
        };

        let transport = match stream.into_std().and_then(PeerTransport::unix) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(error = %err, "failed to prepare peer transport");
                return;
            },
        };

        let id = self.next_id();
        let router = self.router_tx.clone();
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            run_peer(
                id,
                transport,
                credentials.map(|c| c.uid),
                router,
                config,
                cancel,
            )
            .await;
            drop(permit);
        });
    }

    fn spawn_tcp_peer(&self, stream: TcpStream, cancel: CancellationToken) {
        let Ok(permit) = self.connection_sem.clone().try_acquire_owned() else {
            warn!("connection limit reached, refusing tcp peer");
            return;
        };

        let id = self.next_id();
        let router = self.router_tx.clone();
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            run_peer(id, PeerTransport::tcp(stream), None, router, config, cancel).await;
            drop(permit);
        });
    }

    fn next_id(&self) -> PeerId {
        PeerId::from_raw(self.next_peer_id.fetch_add(1, Ordering::Relaxed))
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<TcpStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

fn ensure_directory(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Unlinks a stale socket file; refuses to touch anything that is not one.
fn cleanup_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
        Ok(metadata) => {
            use std::os::unix::fs::FileTypeExt;
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        },
    }
}
