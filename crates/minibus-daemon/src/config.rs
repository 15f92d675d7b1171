//! Broker configuration.
//!
//! Loaded from a TOML file, every field defaulted, CLI flags layered on top
//! by `main`. The bus id and handshake GUID default to fresh random values
//! per process, which is what you want everywhere except tests pinning them.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// Everything tunable about the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Filesystem path of the listening socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Optional TCP listener for remote debugging. No descriptor passing,
    /// no kernel credentials; do not expose this beyond a trusted network.
    #[serde(default)]
    pub tcp_listen: Option<SocketAddr>,

    /// Bus id returned by `GetId`.
    #[serde(default = "random_id")]
    pub bus_id: String,

    /// GUID embedded in the handshake `OK` line.
    #[serde(default = "random_id")]
    pub handshake_guid: String,

    /// Machine id returned by `Peer.GetMachineId`.
    #[serde(default = "random_id")]
    pub machine_id: String,

    /// Concurrent connection ceiling.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Depth of each peer's outbound queue; overflow drops the peer.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Depth of the router mailbox; the inbound backpressure bound.
    #[serde(default = "default_router_queue")]
    pub router_queue: usize,

    /// Wall-clock budget for the authentication handshake.
    #[serde(default = "default_handshake_timeout")]
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Deliver broadcast signals to peers with no match rules. Off by
    /// default; strict match-rule semantics are the correct behaviour.
    #[serde(default)]
    pub compat_broadcast: bool,

    /// Uids below this (other than root) get the permissive policy
    /// defaults.
    #[serde(default = "default_privileged_uid_ceiling")]
    pub privileged_uid_ceiling: u32,
}

fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp/minibus/bus.sock"),
        |dir| PathBuf::from(dir).join("minibus/bus.sock"),
    )
}

fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

const fn default_max_connections() -> usize {
    256
}

const fn default_outbound_queue() -> usize {
    128
}

const fn default_router_queue() -> usize {
    1024
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_privileged_uid_ceiling() -> u32 {
    1000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            tcp_listen: None,
            bus_id: random_id(),
            handshake_guid: random_id(),
            machine_id: random_id(),
            max_connections: default_max_connections(),
            outbound_queue: default_outbound_queue(),
            router_queue: default_router_queue(),
            handshake_timeout: default_handshake_timeout(),
            compat_broadcast: false,
            privileged_uid_ceiling: default_privileged_uid_ceiling(),
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}
