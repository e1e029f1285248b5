//! Transport over a pair of standard streams.
//!
//! Used when the daemon is reached through a helper process that wires its
//! standard streams to the daemon. The handles are supplied by the caller,
//! so the process's own stdin/stdout are only one option. There is no
//! deadline concept on stdio.

use super::Transport;
use crate::stream::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Reader = Pin<Box<dyn AsyncRead + Send>>;
type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// Hands out streams over one shared reader/writer pair
#[derive(Clone)]
pub struct StdioTransport {
    reader: Arc<Mutex<Reader>>,
    writer: Arc<Mutex<Writer>>,
}

impl StdioTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Arc::new(Mutex::new(Box::pin(reader))),
            writer: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    /// Transport over this process's stdin and stdout
    pub fn from_process() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    /// Every dial returns a fresh wrapper over the same handles.
    async fn dial(&self, _target: &str) -> io::Result<BoxedStream> {
        Ok(Box::pin(StdioStream {
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        }))
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

/// Reads from the shared reader, writes to the shared writer
pub struct StdioStream {
    reader: Arc<Mutex<Reader>>,
    writer: Arc<Mutex<Writer>>,
}

fn lock<T>(handle: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    handle
        .lock()
        .map_err(|_| io::Error::other("stdio handle poisoned"))
}

impl AsyncRead for StdioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match lock(&self.reader) {
            Ok(mut reader) => reader.as_mut().poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match lock(&self.writer) {
            Ok(mut writer) => writer.as_mut().poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.writer) {
            Ok(mut writer) => writer.as_mut().poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.writer) {
            Ok(mut writer) => writer.as_mut().poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
