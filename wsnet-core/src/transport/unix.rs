//! Transport dialing the daemon's rendezvous socket

use super::Transport;
use crate::stream::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn dial(&self, _target: &str) -> io::Result<BoxedStream> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Box::pin(stream))
    }

    fn kind(&self) -> &'static str {
        "unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_dial_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let transport = UnixTransport::new(&path);
        assert!(transport.dial("").await.is_ok());
        assert!(UnixTransport::new(dir.path().join("missing.sock"))
            .dial("")
            .await
            .is_err());
    }
}
