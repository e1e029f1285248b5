//! Common utilities and types for the workspace network daemon

pub mod config;
pub mod constants;
pub mod error;

pub use config::{
    HeartbeatConfig, PortForwardConfig, PresenceConfig, ProxyConfig, SshConfig, TopologyConfig,
};
pub use constants::{
    DEFAULT_OVERLAY_DOMAIN, DEFAULT_PORT_FORWARD_PORT, DEFAULT_SSH_PORT, DEFAULT_SSH_TARGET,
    HEADER_PROXY_PORT, HEADER_TARGET_HOST, HEADER_TARGET_PORT, NETMAP_FILE, RUNNER_SUFFIX,
    SOCKET_FILE,
};
pub use error::{NetError, Result};
