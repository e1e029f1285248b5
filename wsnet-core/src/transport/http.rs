//! Fixed-endpoint TCP transport

use super::Transport;
use crate::stream::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default connect timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    addr: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dial(&self, _target: &str) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} timed out", self.addr),
                )
            })??;
        let _ = stream.set_nodelay(true);
        Ok(Box::pin(stream))
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_ignores_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let transport = HttpTransport::new("127.0.0.1", port);
        assert_eq!(transport.addr(), format!("127.0.0.1:{port}"));
        assert!(transport.dial("unrelated:1").await.is_ok());
        assert_eq!(transport.kind(), "http");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new("127.0.0.1", port);
        assert!(transport.dial("").await.is_err());
    }
}
