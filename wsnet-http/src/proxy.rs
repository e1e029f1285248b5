//! HTTP side of the rendezvous socket.
//!
//! HTTP/1.x requests naming a backend through `x-target-host`/`x-target-port`
//! hijack their connection: the request is written to the backend as
//! received and bytes are pumped both ways from then on. `/git-credentials`
//! is relayed to the control-plane runner instead, and two local routes
//! report daemon health and metrics. Those and HTTP/2 are served by hyper,
//! where hijacking is not available.

use crate::client::{into_proxy_response, ProxyBody};
use crate::control::ControlPlane;
use crate::hijack::{self, Opening, RequestHead, MAX_HEAD_BYTES};
use crate::network_proxy::MuxServer;
use crate::serve::ConnectionSet;
use crate::sniff::{PeekedStream, RouteListener};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsnet_common::constants::DEFAULT_REQUEST_TIMEOUT;
use wsnet_common::{NetError, Result, HEADER_TARGET_HOST, HEADER_TARGET_PORT};
use wsnet_core::{Dialer, TcpDialer};
use wsnet_observability::ProxyMetrics;

pub const HEALTH_PATH: &str = "/daemon/health";
pub const METRICS_PATH: &str = "/daemon/metrics";
pub const CREDENTIALS_PATH: &str = "/git-credentials";

/// Runner endpoint the credential relay forwards to
const CREDENTIALS_ENDPOINT: &str = "workspace-git-credentials";

/// Builds a plain-text response with the given status.
pub fn error_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let mut res = Response::new(full_body(Bytes::copy_from_slice(msg.as_bytes())));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Copy bytes both ways until either direction finishes.
///
/// A backend that stops writing while it still reads is a valid state, so
/// completion of one direction ends the tunnel.
pub async fn pump<A, B>(a: A, b: B) -> io::Result<u64>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    tokio::select! {
        res = tokio::io::copy(&mut a_read, &mut b_write) => res,
        res = tokio::io::copy(&mut b_read, &mut a_write) => res,
    }
}

/// Status and message reported when `addr` could not serve a request
pub(crate) fn upstream_failure(err: &NetError, addr: &str) -> (StatusCode, String) {
    match err {
        NetError::Dial { .. } => (StatusCode::BAD_GATEWAY, format!("failed to reach {addr}")),
        NetError::Timeout(_) => (
            StatusCode::BAD_GATEWAY,
            format!("timed out connecting to {addr}"),
        ),
        _ => (StatusCode::BAD_GATEWAY, format!("bad response from {addr}")),
    }
}

/// Relays `/git-credentials` requests to the runner peer
#[derive(Clone)]
pub struct CredentialRelay {
    control: ControlPlane,
}

impl CredentialRelay {
    pub fn new(control: ControlPlane) -> Self {
        Self { control }
    }

    pub async fn forward<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        match self
            .control
            .send(parts.method, CREDENTIALS_ENDPOINT, &parts.headers, body)
            .await
        {
            Ok(res) => into_proxy_response(res),
            Err(NetError::NoRunner) => {
                warn!("Credential request without an active runner");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "no active runner found")
            }
            Err(e) => {
                error!("Credential relay failed: {}", e);
                let (status, msg) = upstream_failure(&e, "runner");
                error_response(status, &msg)
            }
        }
    }
}

/// Routes one HTTP request arriving on the rendezvous socket
pub struct ProxyHandler {
    dialer: Option<Arc<dyn Dialer>>,
    relay: Option<CredentialRelay>,
    metrics: ProxyMetrics,
    dial_timeout: Duration,
}

impl ProxyHandler {
    /// Without a dialer, backends are reached over plain TCP.
    pub fn new(dialer: Option<Arc<dyn Dialer>>, metrics: ProxyMetrics) -> Self {
        Self {
            dialer,
            relay: None,
            metrics,
            dial_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_credential_relay(mut self, relay: CredentialRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match LocalRoute::of(req.method().as_str(), req.uri().path()) {
            LocalRoute::Health => return Response::new(full_body(Bytes::from_static(b"ok"))),
            LocalRoute::Metrics => {
                let mut res = Response::new(full_body(Bytes::from(self.metrics.gather())));
                res.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                return res;
            }
            LocalRoute::Credentials => {
                return match &self.relay {
                    Some(relay) => relay.forward(req).await,
                    None => error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "credential relay unavailable",
                    ),
                };
            }
            LocalRoute::Tunnel => {}
        }

        self.metrics.record_failure();
        if let Err(e) = target_addr(|name| req.headers().get(name).and_then(|v| v.to_str().ok())) {
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
        warn!(version = ?req.version(), "Tunnel request on a connection that cannot be hijacked");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection hijacking not supported",
        )
    }

    /// Serve one connection of the HTTP route.
    ///
    /// `prefix` holds bytes already read from `stream`. An HTTP/1.x tunnel
    /// request takes over the whole connection. Local routes get one request
    /// per connection, and HTTP/2 connections are served until closed.
    pub async fn serve_connection<S>(
        self: Arc<Self>,
        prefix: Bytes,
        mut stream: S,
        stop: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut buf = BytesMut::from(&prefix[..]);
        let opening = tokio::select! {
            () = stop.cancelled() => return,
            res = hijack::read_opening(&mut stream, &mut buf, MAX_HEAD_BYTES) => res,
        };
        let head = match opening {
            Ok(Opening::Closed) => return,
            Ok(Opening::Http2) => {
                self.serve_http2(PeekedStream::new(buf.freeze(), stream), stop)
                    .await;
                return;
            }
            Ok(Opening::Http1(head)) => head,
            Err(e) => {
                self.metrics.record_failure();
                debug!("Rejected HTTP connection: {}", e);
                hijack::write_response(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await;
                return;
            }
        };

        let path = head.path.split('?').next().unwrap_or_default();
        if !matches!(LocalRoute::of(&head.method, path), LocalRoute::Tunnel) {
            self.serve_http1(PeekedStream::new(buf.freeze(), stream), stop)
                .await;
            return;
        }

        let addr = match head_target(&head) {
            Ok(addr) => addr,
            Err(e) => {
                self.metrics.record_failure();
                hijack::write_response(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await;
                return;
            }
        };
        debug!(backend = %addr, method = %head.method, path = %head.path, "Tunnel request");

        let dialer: &dyn Dialer = match &self.dialer {
            Some(dialer) => dialer.as_ref(),
            None => &TcpDialer,
        };
        hijack::tunnel(
            dialer,
            &addr,
            buf.freeze(),
            stream,
            self.dial_timeout,
            &self.metrics,
            &stop,
        )
        .await;
    }

    async fn serve_http1<S>(self: Arc<Self>, stream: S, stop: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = self.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });
        let conn = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!("HTTP connection error: {:?}", e);
                }
            }
            () = stop.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
    }

    async fn serve_http2<S>(self: Arc<Self>, stream: S, stop: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = self.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });
        let conn = http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!("HTTP/2 connection error: {:?}", e);
                }
            }
            () = stop.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
    }
}

/// Requests answered without a backend
enum LocalRoute {
    Health,
    Metrics,
    Credentials,
    Tunnel,
}

impl LocalRoute {
    fn of(method: &str, path: &str) -> Self {
        match (method, path) {
            ("GET", HEALTH_PATH) => LocalRoute::Health,
            ("GET", METRICS_PATH) => LocalRoute::Metrics,
            (_, CREDENTIALS_PATH) => LocalRoute::Credentials,
            _ => LocalRoute::Tunnel,
        }
    }
}

fn target_addr<'a>(header: impl Fn(&'static str) -> Option<&'a str>) -> Result<String> {
    let required = |name: &'static str| {
        header(name)
            .filter(|v| !v.is_empty())
            .ok_or(NetError::MissingMetadata(name))
    };
    let host = required(HEADER_TARGET_HOST)?;
    let port = required(HEADER_TARGET_PORT)?;
    Ok(format!("{host}:{port}"))
}

fn head_target(head: &RequestHead) -> Result<String> {
    target_addr(|name| head.header(name))
}

/// Server for the HTTP route of the mux
pub struct HttpProxyServer {
    handler: Arc<ProxyHandler>,
    conns: ConnectionSet,
}

impl HttpProxyServer {
    pub fn new(handler: ProxyHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            conns: ConnectionSet::new(),
        }
    }
}

#[async_trait]
impl MuxServer for HttpProxyServer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn serve(&self, mut listener: RouteListener) -> Result<()> {
        let stopping = self.conns.stopping();
        info!("HTTP proxy server started");
        loop {
            let stream = tokio::select! {
                () = stopping.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(stream) => stream,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            };

            let handler = self.handler.clone();
            let stop = self.conns.stopping();
            self.conns.spawn(async move {
                let (prefix, inner) = stream.into_inner();
                handler.serve_connection(prefix, inner, stop).await;
            });
        }
    }

    async fn shutdown(&self) {
        self.conns.shutdown().await;
        debug!("HTTP proxy server stopped");
    }
}
