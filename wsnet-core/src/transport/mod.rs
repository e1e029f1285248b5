//! Client-side dial strategies for reaching the daemon.
//!
//! Every strategy implements [`Transport`] and labels itself through
//! [`Transport::kind`], which [`health::check_health`] reports verbatim.

use crate::stream::BoxedStream;
use async_trait::async_trait;
use std::io;

pub mod fallback;
pub mod health;
pub mod http;
pub mod pool;
pub mod stdio;
#[cfg(unix)]
pub mod unix;

pub use fallback::FallbackTransport;
pub use health::{check_health, HealthStatus};
pub use http::HttpTransport;
pub use pool::{ConnectionPool, PoolConfig, PooledConn};
pub use stdio::StdioTransport;
#[cfg(unix)]
pub use unix::UnixTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `target`. Fixed-endpoint transports ignore it.
    async fn dial(&self, target: &str) -> io::Result<BoxedStream>;

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// Short label used in health reports
    fn kind(&self) -> &'static str {
        "unknown"
    }
}
