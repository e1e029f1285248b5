//! Fixed-capacity pool of client connections.
//!
//! The pool never dials. Connections enter through [`ConnectionPool::adopt`]
//! and circulate through `get`/`put`; an empty idle set is an error rather
//! than a reason to open a new connection.

use crate::stream::BoxedStream;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wsnet_common::{NetError, Result};

/// Connection pool configuration
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum connections kept idle (default: 4)
    pub max_idle: usize,
    /// Maximum connections owned by the pool, idle and active (default: 16)
    pub max_active: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            max_active: 16,
        }
    }
}

/// A connection owned by a [`ConnectionPool`].
///
/// Once closed, reads and writes fail with `BrokenPipe`.
pub struct PooledConn {
    id: u64,
    stream: BoxedStream,
    closed: CancellationToken,
}

impl PooledConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "pooled connection closed")
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for PooledConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Err(Self::closed_error()));
        }
        self.get_mut().stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.is_closed() {
            return Poll::Ready(Err(Self::closed_error()));
        }
        self.get_mut().stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Err(Self::closed_error()));
        }
        self.get_mut().stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Ok(()));
        }
        self.get_mut().stream.as_mut().poll_shutdown(cx)
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConn>,
    active: HashSet<u64>,
}

pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Take ownership of a freshly dialed stream and hand it out as active.
    pub async fn adopt(&self, stream: BoxedStream) -> Result<PooledConn> {
        if self.closed.is_cancelled() {
            return Err(NetError::InvalidState("connection pool closed".into()));
        }
        let mut state = self.state.lock().await;
        if state.idle.len() + state.active.len() >= self.config.max_active {
            return Err(NetError::PoolExhausted);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.active.insert(id);
        Ok(PooledConn {
            id,
            stream,
            closed: self.closed.child_token(),
        })
    }

    /// Hand out the most recently returned idle connection.
    pub async fn get(&self) -> Result<PooledConn> {
        let mut state = self.state.lock().await;
        while let Some(conn) = state.idle.pop_back() {
            if conn.is_closed() {
                debug!(id = conn.id, "Discarding closed pooled connection");
                continue;
            }
            state.active.insert(conn.id);
            return Ok(conn);
        }
        Err(NetError::PoolExhausted)
    }

    /// Return a connection. Surplus or closed connections are closed and dropped.
    pub async fn put(&self, conn: PooledConn) {
        let mut state = self.state.lock().await;
        state.active.remove(&conn.id);

        if conn.is_closed() || self.closed.is_cancelled() {
            conn.close();
            return;
        }
        if state.idle.len() >= self.config.max_idle {
            debug!(id = conn.id, "Idle set full, closing connection");
            conn.close();
            return;
        }
        state.idle.push_back(conn);
    }

    /// Close every connection, idle and handed out.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut state = self.state.lock().await;
        state.idle.clear();
        state.active.clear();
    }

    pub async fn idle_len(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn active_len(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
