pub mod mesh;
pub mod monitor;
pub mod stream;
pub mod topology;
pub mod tracker;
pub mod transport;

// Re-export specific items for convenience
pub use mesh::{DirectNetwork, Dialer, MeshClient, MeshListener, NetworkJoiner, TcpDialer};
pub use monitor::ConnectionMonitor;
pub use stream::{AsyncStream, BoxedStream, TrackedStream};
pub use topology::TopologyWatcher;
pub use tracker::{Connection, ConnectionTracker, ServiceTracker};
pub use transport::{
    check_health, ConnectionPool, FallbackTransport, HealthStatus, HttpTransport, PoolConfig,
    PooledConn, StdioTransport, Transport,
};
#[cfg(unix)]
pub use transport::UnixTransport;
