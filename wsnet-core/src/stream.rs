//! Stream types shared by dialers, listeners and services

use crate::tracker::{ConnectionTracker, ServiceTracker};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Minimum spacing between two `last_seen` refreshes from one stream
const TOUCH_INTERVAL: Duration = Duration::from_secs(1);

/// A stream registered in both trackers for as long as it lives.
///
/// Once the staleness sweep evicts the connection, reads report end of
/// stream and writes fail, so whoever pumps it winds down.
pub struct TrackedStream<S> {
    inner: S,
    id: String,
    connections: ConnectionTracker,
    last_touch: Instant,
    evicted: CancellationToken,
    eviction: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> TrackedStream<S> {
    pub fn new(
        inner: S,
        remote_addr: impl Into<String>,
        service: &'static str,
        connections: ConnectionTracker,
        services: ServiceTracker,
    ) -> Self {
        let id = format!("{service}-{}", Uuid::new_v4());
        let evicted = connections.track(id.clone(), remote_addr, service, &services);
        Self {
            inner,
            id,
            connections,
            last_touch: Instant::now(),
            eviction: Box::pin(evicted.clone().cancelled_owned()),
            evicted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires when the connection is evicted as stale
    pub fn eviction(&self) -> CancellationToken {
        self.evicted.clone()
    }

    fn touch(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_touch) >= TOUCH_INTERVAL {
            self.last_touch = now;
            self.connections.update(&self.id);
        }
    }

    fn poll_evicted(&mut self, cx: &mut Context<'_>) -> bool {
        self.evicted.is_cancelled() || self.eviction.as_mut().poll(cx).is_ready()
    }
}

fn evicted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection evicted as stale")
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.connections.remove(&self.id);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_evicted(cx) {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.touch();
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.evicted.is_cancelled() {
            return Poll::Ready(Err(evicted_error()));
        }
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.touch();
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
