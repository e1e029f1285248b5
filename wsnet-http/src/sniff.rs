//! Protocol sniffing for the rendezvous socket.
//!
//! A new connection is read just far enough to tell gRPC from everything
//! else: the HTTP/2 client preface followed by a HEADERS block carrying
//! `content-type: application/grpc`. Nothing is written to the peer while
//! sniffing, and every byte read is replayed to the server that claims the
//! connection through [`PeekedStream`].

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsnet_common::constants::SERVICE_NETWORK_PROXY;
use wsnet_common::ProxyConfig;
use wsnet_core::{BoxedStream, ConnectionTracker, ServiceTracker, TrackedStream};

/// HTTP/2 client connection preface
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const READ_CHUNK: usize = 4096;
const ROUTE_BACKLOG: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Grpc,
    Http,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Grpc => write!(f, "grpc"),
            Route::Http => write!(f, "http"),
        }
    }
}

enum Verdict {
    Decided(Route),
    NeedMore,
}

/// Decide a route from the bytes read so far.
fn inspect(buf: &[u8]) -> Verdict {
    let n = buf.len().min(H2_PREFACE.len());
    if buf[..n] != H2_PREFACE[..n] {
        return Verdict::Decided(Route::Http);
    }
    if buf.len() < H2_PREFACE.len() {
        return Verdict::NeedMore;
    }

    let mut pos = H2_PREFACE.len();
    let mut block: Option<Vec<u8>> = None;
    loop {
        if buf.len() < pos + FRAME_HEADER_LEN {
            return Verdict::NeedMore;
        }
        let header = &buf[pos..pos + FRAME_HEADER_LEN];
        let len = (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2]);
        let kind = header[3];
        let flags = header[4];
        let start = pos + FRAME_HEADER_LEN;
        if buf.len() < start + len {
            return Verdict::NeedMore;
        }
        let payload = &buf[start..start + len];
        pos = start + len;

        match (block.as_mut(), kind) {
            (Some(fragment), FRAME_CONTINUATION) => fragment.extend_from_slice(payload),
            // A header block must be continued before any other frame
            (Some(_), _) => return Verdict::Decided(Route::Http),
            (None, FRAME_HEADERS) => match header_fragment(payload, flags) {
                Some(fragment) => block = Some(fragment.to_vec()),
                None => return Verdict::Decided(Route::Http),
            },
            // SETTINGS, WINDOW_UPDATE, PRIORITY and friends precede the first request
            (None, _) => continue,
        }

        if flags & FLAG_END_HEADERS != 0 {
            let fragment = block.take().unwrap_or_default();
            return Verdict::Decided(route_for_headers(&fragment));
        }
    }
}

/// Strip padding and priority fields from a HEADERS payload.
fn header_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut rest = payload;
    let mut pad = 0usize;
    if flags & FLAG_PADDED != 0 {
        let (&len, tail) = rest.split_first()?;
        pad = usize::from(len);
        rest = tail;
    }
    if flags & FLAG_PRIORITY != 0 {
        rest = rest.get(5..)?;
    }
    rest.get(..rest.len().checked_sub(pad)?)
}

fn route_for_headers(block: &[u8]) -> Route {
    let mut decoder = hpack::Decoder::new();
    match decoder.decode(block) {
        Ok(headers) => {
            let grpc = headers.iter().any(|(name, value)| {
                name.as_slice() == b"content-type" && value.starts_with(b"application/grpc")
            });
            if grpc {
                Route::Grpc
            } else {
                Route::Http
            }
        }
        Err(e) => {
            debug!("Undecodable header block while sniffing: {:?}", e);
            Route::Http
        }
    }
}

/// Read from `stream` until its route is known.
///
/// Connections that close early or exceed `max_bytes` without a verdict are
/// handed to the HTTP side.
pub async fn classify<S>(mut stream: S, max_bytes: usize) -> io::Result<(Route, PeekedStream<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let route = loop {
        buf.reserve(READ_CHUNK);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            break Route::Http;
        }
        if let Verdict::Decided(route) = inspect(&buf) {
            break route;
        }
        if buf.len() >= max_bytes {
            break Route::Http;
        }
    };
    Ok((route, PeekedStream::new(buf.freeze(), stream)))
}

/// A stream that yields already-consumed bytes before reading live data
pub struct PeekedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet replayed
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connection handed to a server after classification
pub type RoutedStream = PeekedStream<BoxedStream>;

/// Accept side of one route of the [`Mux`]
pub struct RouteListener {
    route: Route,
    rx: mpsc::Receiver<RoutedStream>,
}

impl RouteListener {
    pub fn route(&self) -> Route {
        self.route
    }

    /// Next classified connection. Fails with `NotConnected` once the mux is gone.
    pub async fn accept(&mut self) -> io::Result<RoutedStream> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "multiplexer closed")
        })
    }
}

/// Splits one socket listener into a gRPC and an HTTP listener
pub struct Mux {
    listener: UnixListener,
    grpc: mpsc::Sender<RoutedStream>,
    http: mpsc::Sender<RoutedStream>,
    sniff_timeout: Duration,
    max_sniff_bytes: usize,
    trackers: Option<(ConnectionTracker, ServiceTracker)>,
}

impl Mux {
    pub fn new(listener: UnixListener, config: &ProxyConfig) -> (Self, RouteListener, RouteListener) {
        let (grpc, grpc_rx) = mpsc::channel(ROUTE_BACKLOG);
        let (http, http_rx) = mpsc::channel(ROUTE_BACKLOG);
        let mux = Self {
            listener,
            grpc,
            http,
            sniff_timeout: config.sniff_timeout,
            max_sniff_bytes: config.max_sniff_bytes,
            trackers: None,
        };
        (
            mux,
            RouteListener {
                route: Route::Grpc,
                rx: grpc_rx,
            },
            RouteListener {
                route: Route::Http,
                rx: http_rx,
            },
        )
    }

    /// Register every accepted connection in the given trackers.
    #[must_use]
    pub fn with_trackers(mut self, connections: ConnectionTracker, services: ServiceTracker) -> Self {
        self.trackers = Some((connections, services));
        self
    }

    /// Accept and classify connections until cancelled.
    ///
    /// Dropping the mux closes the listener and, once in-flight
    /// classifications finish, both route listeners.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        loop {
            let stream = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Multiplexer stopped");
                    return Ok(());
                }
                res = self.listener.accept() => res?.0,
            };

            let stream: BoxedStream = match &self.trackers {
                Some((connections, services)) => Box::pin(TrackedStream::new(
                    stream,
                    "rendezvous",
                    SERVICE_NETWORK_PROXY,
                    connections.clone(),
                    services.clone(),
                )),
                None => Box::pin(stream),
            };

            let grpc = self.grpc.clone();
            let http = self.http.clone();
            let sniff_timeout = self.sniff_timeout;
            let max_bytes = self.max_sniff_bytes;
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let classified = tokio::select! {
                    () = cancel.cancelled() => return,
                    res = tokio::time::timeout(sniff_timeout, classify(stream, max_bytes)) => res,
                };
                let (route, stream) = match classified {
                    Ok(Ok(classified)) => classified,
                    Ok(Err(e)) => {
                        debug!("Failed to classify connection: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!("Connection did not identify its protocol in {:?}", sniff_timeout);
                        return;
                    }
                };
                let tx = match route {
                    Route::Grpc => grpc,
                    Route::Http => http,
                };
                debug!(%route, "Routing connection");
                if tx.send(stream).await.is_err() {
                    debug!(%route, "No server accepting connections");
                }
            });
        }
    }
}
