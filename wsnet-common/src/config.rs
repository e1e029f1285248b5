//! Configuration types for daemon services

use crate::constants::{
    DEFAULT_GRACEFUL_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PORT_FORWARD_PORT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SSH_PORT, DEFAULT_SSH_TARGET, DEFAULT_STALE_TIMEOUT,
    DEFAULT_SWEEP_INTERVAL, DEFAULT_TOPOLOGY_COOLDOWN, NETMAP_FILE, SERVICE_PORT_FORWARD,
    SERVICE_SSH, SOCKET_FILE,
};
use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rendezvous socket and protocol multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Directory holding the rendezvous socket
    pub root_dir: PathBuf,
    /// Socket file name inside `root_dir` (default: devpod-net.sock)
    pub socket_name: String,
    /// Upper bound for the graceful stop of both servers (default: 15s)
    pub graceful_timeout: Duration,
    /// Time allowed to classify a new connection (default: 5s)
    pub sniff_timeout: Duration,
    /// Maximum bytes buffered while classifying (default: 64KB)
    pub max_sniff_bytes: usize,
    /// Timeout for dialing a backend (default: 10s)
    pub dial_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Full path of the rendezvous socket
    pub fn socket_path(&self) -> PathBuf {
        self.root_dir.join(&self.socket_name)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/run/devpod"),
            socket_name: SOCKET_FILE.to_string(),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            sniff_timeout: Duration::from_secs(5),
            max_sniff_bytes: 64 * 1024,
            dial_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Staleness policy for tracked connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the sweep runs (default: 30s)
    pub interval: Duration,
    /// Idle time after which a connection is evicted (default: 90s)
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// A single missed tick must never evict a live connection.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(NetError::Config("heartbeat interval must be non-zero".into()));
        }
        if self.timeout <= self.interval {
            return Err(NetError::Config(format!(
                "heartbeat timeout {:?} must exceed interval {:?}",
                self.timeout, self.interval
            )));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// Control-plane presence notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Tick interval (default: 10s)
    pub interval: Duration,
    /// Deadline for a single heartbeat request (default: 10s)
    pub request_timeout: Duration,
    /// Services whose open connections keep the workspace alive
    pub services: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            services: vec![SERVICE_SSH.to_string(), SERVICE_PORT_FORWARD.to_string()],
        }
    }
}

/// Topology snapshot persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Minimum time between two snapshot writes (default: 5s)
    pub cooldown: Duration,
    /// Snapshot file name inside the root directory
    pub file_name: String,
}

impl TopologyConfig {
    pub fn snapshot_path(&self, root_dir: &Path) -> PathBuf {
        root_dir.join(&self.file_name)
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_TOPOLOGY_COOLDOWN,
            file_name: NETMAP_FILE.to_string(),
        }
    }
}

/// SSH forwarding over the overlay network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Overlay port to accept SSH connections on
    pub listen_port: u16,
    /// Local SSH server address
    pub target_addr: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_SSH_PORT,
            target_addr: DEFAULT_SSH_TARGET.to_string(),
        }
    }
}

/// HTTP port forwarding over the overlay network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardConfig {
    /// Overlay port of the reverse-proxy listener (default: 12051)
    pub listen_port: u16,
    /// Host that forwarded ports are reached on
    pub local_host: String,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT_FORWARD_PORT,
            local_host: "127.0.0.1".to_string(),
        }
    }
}
