//! Raw HTTP/1.x tunnelling.
//!
//! The first request head on a connection is parsed just far enough to find
//! the backend. Every byte read so far is then written to the backend as
//! received, and both connections are spliced until either side closes.

use crate::proxy::{pump, upstream_failure};
use crate::sniff::H2_PREFACE;
use bytes::{Bytes, BytesMut};
use hyper::StatusCode;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsnet_common::{NetError, Result};
use wsnet_core::Dialer;
use wsnet_observability::ProxyMetrics;

/// Largest request head accepted before the connection is refused
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;

/// Request line and headers of the first request on a connection
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Value of a non-empty header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, v)| n.eq_ignore_ascii_case(name) && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    /// Like [`header`](Self::header), failing with missing metadata.
    pub fn require(&self, name: &'static str) -> Result<&str> {
        self.header(name).ok_or(NetError::MissingMetadata(name))
    }
}

/// How a connection on the HTTP side starts
#[derive(Debug)]
pub enum Opening {
    /// HTTP/2 client preface
    Http2,
    Http1(RequestHead),
    /// Closed before a complete request head arrived
    Closed,
}

/// Read from `stream` into `buf` until the opening of the connection is known.
///
/// `buf` may already hold bytes consumed elsewhere. Nothing read is lost: on
/// return `buf` holds everything that was read.
pub async fn read_opening<S>(stream: &mut S, buf: &mut BytesMut, max_bytes: usize) -> Result<Opening>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(opening) = parse_opening(buf)? {
            return Ok(opening);
        }
        if buf.len() >= max_bytes {
            return Err(NetError::Http("request head too large".into()));
        }
        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            return Ok(Opening::Closed);
        }
    }
}

fn parse_opening(buf: &[u8]) -> Result<Option<Opening>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let n = buf.len().min(H2_PREFACE.len());
    if buf[..n] == H2_PREFACE[..n] {
        return Ok((n == H2_PREFACE.len()).then_some(Opening::Http2));
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => Ok(Some(Opening::Http1(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect(),
        }))),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(NetError::Http(format!("malformed request: {e}"))),
    }
}

/// Write a complete plain-text response and close the write side.
pub async fn write_response<W>(stream: &mut W, status: StatusCode, msg: &str)
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        msg.len()
    );
    let res = async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(msg.as_bytes()).await?;
        stream.shutdown().await
    }
    .await;
    if let Err(e) = res {
        debug!("Failed to write {} response: {}", status, e);
    }
}

/// Dial `addr`, replay `buffered` onto it and splice it with `client` until
/// either side closes or `stop` fires.
pub async fn tunnel<S>(
    dialer: &dyn Dialer,
    addr: &str,
    buffered: Bytes,
    mut client: S,
    dial_timeout: Duration,
    metrics: &ProxyMetrics,
    stop: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut timer = metrics.start_request();

    let dialed = tokio::time::timeout(dial_timeout, dialer.dial(addr))
        .await
        .map_err(|_| NetError::Timeout(format!("dial {addr}")))
        .and_then(|res| {
            res.map_err(|source| NetError::Dial {
                addr: addr.to_string(),
                source,
            })
        });
    let mut backend = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            timer.fail();
            warn!(backend = %addr, "Tunnel dial failed: {}", e);
            let (status, msg) = upstream_failure(&e, addr);
            write_response(&mut client, status, &msg).await;
            return;
        }
    };
    timer.record_latency();

    if let Err(e) = backend.write_all(&buffered).await {
        timer.fail();
        let e = NetError::Http(format!("writing request: {e}"));
        warn!(backend = %addr, "Tunnel failed: {}", e);
        let (status, msg) = upstream_failure(&e, addr);
        write_response(&mut client, status, &msg).await;
        return;
    }

    tokio::select! {
        res = pump(client, backend) => match res {
            Ok(bytes) => debug!(backend = %addr, bytes, "Tunnel closed"),
            Err(e) => debug!(backend = %addr, "Tunnel ended with error: {}", e),
        },
        () = stop.cancelled() => debug!(backend = %addr, "Tunnel closed by shutdown"),
    }
}
