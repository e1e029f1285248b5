//! Default names, ports and timings for daemon services.
//!
//! Services never read these directly; they are injected through the config
//! structs in [`crate::config`] so several daemons can run side by side.

use std::time::Duration;

/// File name of the rendezvous socket under the daemon root directory.
pub const SOCKET_FILE: &str = "devpod-net.sock";

/// File name of the persisted topology snapshot under the daemon root directory.
pub const NETMAP_FILE: &str = "netmap.json";

/// Overlay port of the HTTP reverse-proxy listener used by port forwarding.
pub const DEFAULT_PORT_FORWARD_PORT: u16 = 12051;

/// Overlay port the SSH forwarder listens on.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Local SSH server the SSH forwarder hands connections to.
pub const DEFAULT_SSH_TARGET: &str = "127.0.0.1:8022";

/// DNS suffix of nodes on the overlay network.
pub const DEFAULT_OVERLAY_DOMAIN: &str = "ts.loft";

/// Hostname suffix identifying control-plane runner peers.
pub const RUNNER_SUFFIX: &str = "runner";

/// Metadata header naming the backend host.
pub const HEADER_TARGET_HOST: &str = "x-target-host";

/// Metadata header naming the backend's declared port.
pub const HEADER_TARGET_PORT: &str = "x-target-port";

/// Metadata header naming the port actually dialed for gRPC calls.
pub const HEADER_PROXY_PORT: &str = "x-proxy-port";

/// Service name used by the SSH forwarder in the service tracker.
pub const SERVICE_SSH: &str = "ssh";

/// Service name used by the port-forward listener in the service tracker.
pub const SERVICE_PORT_FORWARD: &str = "port-forward";

/// Service name used by rendezvous socket connections in the service tracker.
pub const SERVICE_NETWORK_PROXY: &str = "network-proxy";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_TOPOLOGY_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(90);
