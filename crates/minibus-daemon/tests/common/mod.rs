//! Test harness: an in-process broker plus a raw-protocol client.
//!
//! `TestBroker` runs the real router and listener on a socket in a temporary
//! directory. `TestClient` speaks the actual wire protocol — NUL byte, SASL
//! lines, then framed binary messages — over that socket, so every test
//! exercises the same code paths a real D-Bus client would.

#![allow(dead_code)] // each test binary uses a different slice of the harness

use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use minibus_core::framer;
use minibus_core::{Message, Value};
use minibus_daemon::config::BrokerConfig;
use minibus_daemon::observer::{BusEvent, ObserverFeed};
use minibus_daemon::peer::transport::PeerTransport;
use minibus_daemon::router::{NoForwarder, Router};
use minibus_daemon::server::BrokerServer;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Per-step deadline; nothing in these tests should take anywhere near it.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus id pinned by the test configuration.
pub const TEST_BUS_ID: &str = "feedfacefeedfacefeedfacefeedface";

/// A live broker on a temporary socket.
pub struct TestBroker {
    /// Temporary directory holding the socket; dropped last.
    _dir: TempDir,
    /// The broker's configuration, socket path included.
    pub config: Arc<BrokerConfig>,
    /// Observer feed subscription point.
    pub observer: ObserverFeed,
    shutdown: CancellationToken,
}

impl TestBroker {
    /// Starts a broker with test-friendly defaults.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a broker after letting the caller adjust the configuration.
    pub async fn start_with(mutate: impl FnOnce(&mut BrokerConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = BrokerConfig::default();
        config.socket_path = dir.path().join("bus.sock");
        config.bus_id = TEST_BUS_ID.to_owned();
        config.handshake_guid = TEST_BUS_ID.to_owned();
        // Whatever uid the test runs as, authenticated peers get the
        // permissive defaults.
        config.privileged_uid_ceiling = u32::MAX;
        mutate(&mut config);
        let config = Arc::new(config);

        let observer = ObserverFeed::default();
        let (router_tx, router) = Router::new(
            Arc::clone(&config),
            observer.clone(),
            Box::new(NoForwarder),
        );
        tokio::spawn(router.run());

        let server = BrokerServer::bind(Arc::clone(&config), router_tx)
            .await
            .expect("bind test broker");
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        Self {
            _dir: dir,
            config,
            observer,
            shutdown,
        }
    }

    /// Subscribes to the observer feed.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.observer.subscribe()
    }

    /// Connects a new raw client (not yet authenticated).
    pub fn connect(&self) -> TestClient {
        let stream =
            StdUnixStream::connect(&self.config.socket_path).expect("connect to test broker");
        TestClient::new(PeerTransport::unix(stream).expect("wrap client socket"))
    }

    /// Connects, authenticates via EXTERNAL, and says Hello.
    pub async fn client(&self) -> TestClient {
        let mut client = self.connect();
        client.authenticate(false).await;
        client.hello().await;
        client
    }

    /// Same, with descriptor passing negotiated.
    pub async fn client_with_fds(&self) -> TestClient {
        let mut client = self.connect();
        client.authenticate(true).await;
        client.hello().await;
        client
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A raw-protocol D-Bus client for tests.
pub struct TestClient {
    transport: PeerTransport,
    buf: BytesMut,
    /// Descriptors received but not yet claimed by a decoded message.
    fds: Vec<OwnedFd>,
    next_serial: u32,
    /// Unique name, once `hello` ran.
    pub unique: String,
}

impl TestClient {
    fn new(transport: PeerTransport) -> Self {
        Self {
            transport,
            buf: BytesMut::new(),
            fds: Vec::new(),
            next_serial: 1,
            unique: String::new(),
        }
    }

    /// Runs the SASL exchange: NUL, `AUTH EXTERNAL <hex-uid>`, optionally
    /// `NEGOTIATE_UNIX_FD`, then `BEGIN`.
    pub async fn authenticate(&mut self, negotiate_fds: bool) {
        let uid = nix::unistd::getuid().as_raw();
        let hex: String = uid
            .to_string()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect();

        self.send_raw(format!("\0AUTH EXTERNAL {hex}\r\n").as_bytes())
            .await;
        let line = self.read_line().await;
        assert!(line.starts_with("OK "), "unexpected auth reply: {line}");

        if negotiate_fds {
            self.send_raw(b"NEGOTIATE_UNIX_FD\r\n").await;
            let line = self.read_line().await;
            assert_eq!(line, "AGREE_UNIX_FD", "fd negotiation refused");
        }

        self.send_raw(b"BEGIN\r\n").await;
    }

    /// Runs the SASL exchange with the `ANONYMOUS` mechanism.
    pub async fn authenticate_anonymous(&mut self) {
        self.send_raw(b"\0AUTH ANONYMOUS\r\n").await;
        let line = self.read_line().await;
        assert!(line.starts_with("OK "), "unexpected auth reply: {line}");
        self.send_raw(b"BEGIN\r\n").await;
    }

    /// Calls `Hello` and records the assigned unique name.
    pub async fn hello(&mut self) -> String {
        let reply = self
            .call(
                Message::method_call("/org/freedesktop/DBus", "Hello")
                    .with_interface("org.freedesktop.DBus")
                    .with_destination("org.freedesktop.DBus"),
            )
            .await;
        let unique = reply.body[0].as_str().expect("unique name").to_owned();
        self.unique = unique.clone();
        unique
    }

    /// Sends a message, stamping the next serial. Returns the serial used.
    pub async fn send(&mut self, message: Message) -> u32 {
        self.send_with_fds(message, &[]).await
    }

    /// Sends a message with raw descriptors as ancillary data.
    pub async fn send_with_fds(&mut self, mut message: Message, fds: &[RawFd]) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        message.serial = serial;
        let bytes = framer::encode_message(&message).expect("encode test message");
        self.transport
            .send_all(&bytes, fds)
            .await
            .expect("send test message");
        serial
    }

    /// Sends a method call and waits for its reply (return or error),
    /// skipping unrelated traffic such as signals.
    pub async fn call(&mut self, message: Message) -> Message {
        let serial = self.send(message).await;
        loop {
            let inbound = self.next_message().await;
            if inbound.reply_serial == Some(serial) {
                return inbound;
            }
        }
    }

    /// A convenience bus call with one string argument.
    pub async fn bus_call(&mut self, member: &str, body: Vec<Value>) -> Message {
        self.call(
            Message::method_call("/org/freedesktop/DBus", member)
                .with_interface("org.freedesktop.DBus")
                .with_destination("org.freedesktop.DBus")
                .with_body(body),
        )
        .await
    }

    /// `RequestName`, returning the reply code.
    pub async fn request_name(&mut self, name: &str, flags: u32) -> u32 {
        let reply = self
            .bus_call(
                "RequestName",
                vec![Value::String(name.to_owned()), Value::UInt32(flags)],
            )
            .await;
        assert!(
            reply.error_name.is_none(),
            "RequestName failed: {:?}",
            reply.error_name
        );
        reply.body[0].as_u32().expect("reply code")
    }

    /// `ReleaseName`, returning the reply code.
    pub async fn release_name(&mut self, name: &str) -> u32 {
        let reply = self
            .bus_call("ReleaseName", vec![Value::String(name.to_owned())])
            .await;
        reply.body[0].as_u32().expect("reply code")
    }

    /// `AddMatch` with the given rule text.
    pub async fn add_match(&mut self, rule: &str) {
        let reply = self
            .bus_call("AddMatch", vec![Value::String(rule.to_owned())])
            .await;
        assert!(
            reply.error_name.is_none(),
            "AddMatch failed: {:?}",
            reply.error_name
        );
    }

    /// Receives the next message, attaching any descriptors it declared.
    pub async fn next_message(&mut self) -> Message {
        let step = async {
            loop {
                if let Some((mut message, consumed)) =
                    framer::decode_message(&self.buf).expect("decode inbound")
                {
                    self.buf.advance(consumed);
                    let count = message.unix_fds as usize;
                    assert!(
                        self.fds.len() >= count,
                        "message declared {count} descriptors, {} queued",
                        self.fds.len()
                    );
                    message.fds = self.fds.drain(..count).collect();
                    return message;
                }
                let n = self
                    .transport
                    .recv(&mut self.buf, &mut self.fds)
                    .await
                    .expect("recv");
                assert!(n > 0, "broker closed the connection");
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, step)
            .await
            .expect("timed out waiting for a message")
    }

    /// Like [`next_message`](Self::next_message), but tolerates a message
    /// whose declared descriptor count exceeds what actually arrived — the
    /// expected shape when the broker dropped descriptors for a peer that
    /// never negotiated passing.
    pub async fn next_message_allow_missing_fds(&mut self) -> Message {
        let step = async {
            loop {
                if let Some((mut message, consumed)) =
                    framer::decode_message(&self.buf).expect("decode inbound")
                {
                    self.buf.advance(consumed);
                    let count = (message.unix_fds as usize).min(self.fds.len());
                    message.fds = self.fds.drain(..count).collect();
                    return message;
                }
                let n = self
                    .transport
                    .recv(&mut self.buf, &mut self.fds)
                    .await
                    .expect("recv");
                assert!(n > 0, "broker closed the connection");
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, step)
            .await
            .expect("timed out waiting for a message")
    }

    /// Asserts that nothing arrives within a short grace window.
    pub async fn expect_silence(&mut self, window: Duration) {
        let step = async {
            let n = self
                .transport
                .recv(&mut self.buf, &mut self.fds)
                .await
                .expect("recv");
            n
        };
        match tokio::time::timeout(window, step).await {
            Err(_) => {}, // silence, as expected
            Ok(n) => {
                // Bytes arrived; fail if they frame into a message.
                assert!(n > 0, "broker closed the connection");
                if let Some((message, _)) =
                    framer::decode_message(&self.buf).expect("decode inbound")
                {
                    panic!("expected silence, received {message:?}");
                }
            },
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.transport
            .send_all(bytes, &[])
            .await
            .expect("send handshake bytes");
    }

    async fn read_line(&mut self) -> String {
        let step = async {
            loop {
                if let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") {
                    let line = self.buf.split_to(end + 2);
                    return String::from_utf8(line[..end].to_vec()).expect("utf8 line");
                }
                let n = self
                    .transport
                    .recv(&mut self.buf, &mut self.fds)
                    .await
                    .expect("recv");
                assert!(n > 0, "broker closed during handshake");
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, step)
            .await
            .expect("timed out waiting for a handshake line")
    }
}
