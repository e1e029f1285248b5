//! gRPC side of the rendezvous socket.
//!
//! No service is registered locally: every call is handed to the
//! [`Director`], which picks the backend from the call metadata, dials it
//! over the overlay network and streams the call through unchanged,
//! trailers included.

use crate::client::ProxyBody;
use crate::network_proxy::MuxServer;
use crate::proxy::empty_body;
use crate::serve::ConnectionSet;
use crate::sniff::RouteListener;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Code, Status};
use tracing::{debug, info, warn};
use wsnet_common::constants::DEFAULT_REQUEST_TIMEOUT;
use wsnet_common::{NetError, Result, HEADER_PROXY_PORT, HEADER_TARGET_HOST, HEADER_TARGET_PORT};
use wsnet_core::{BoxedStream, Dialer};
use wsnet_observability::ProxyMetrics;

/// Backend named by the forwarding metadata of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    /// Declared service port, forwarded to the backend untouched
    pub target_port: String,
    /// Port actually dialed
    pub proxy_port: String,
}

impl BackendTarget {
    /// All three forwarding headers are mandatory.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let get = |name: &'static str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
                .ok_or(NetError::MissingMetadata(name))
        };
        Ok(Self {
            host: get(HEADER_TARGET_HOST)?,
            target_port: get(HEADER_TARGET_PORT)?,
            proxy_port: get(HEADER_PROXY_PORT)?,
        })
    }

    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.proxy_port)
    }
}

/// Resolves and dials the backend of every proxied call
#[derive(Clone)]
pub struct Director {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    metrics: ProxyMetrics,
}

impl Director {
    pub fn new(dialer: Arc<dyn Dialer>, metrics: ProxyMetrics) -> Self {
        Self {
            dialer,
            dial_timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics,
        }
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Resolve the backend from call metadata and dial it.
    ///
    /// Nothing is dialed when metadata is missing.
    pub async fn connect(&self, headers: &HeaderMap) -> Result<(BackendTarget, BoxedStream)> {
        let target = BackendTarget::from_headers(headers)?;
        let addr = target.dial_addr();
        let stream = tokio::time::timeout(self.dial_timeout, self.dialer.dial(&addr))
            .await
            .map_err(|_| NetError::Timeout(format!("dial {addr}")))?
            .map_err(|source| NetError::Dial { addr, source })?;
        Ok((target, stream))
    }

    /// Proxy one call to its backend.
    pub async fn proxy<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut timer = self.metrics.start_request();
        let path = req.uri().path().to_string();

        let (target, stream) = match self.connect(req.headers()).await {
            Ok(connected) => connected,
            Err(e) => {
                timer.fail();
                warn!(method = %path, "Director failed: {}", e);
                return grpc_error(&status_for(&e));
            }
        };
        timer.record_latency();

        let (mut sender, conn) =
            match hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
            {
                Ok(handshake) => handshake,
                Err(e) => {
                    timer.fail();
                    return grpc_error(&Status::unavailable(format!(
                        "handshake with {} failed: {e}",
                        target.dial_addr()
                    )));
                }
            };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {:?}", e);
            }
        });

        let (mut parts, body) = req.into_parts();
        let backend_uri = Uri::builder()
            .scheme("http")
            .authority(target.dial_addr())
            .path_and_query(parts.uri.path_and_query().map_or("/", |pq| pq.as_str()))
            .build();
        parts.uri = match backend_uri {
            Ok(uri) => uri,
            Err(e) => {
                timer.fail();
                return grpc_error(&Status::invalid_argument(format!("invalid backend uri: {e}")));
            }
        };

        debug!(method = %path, backend = %target.dial_addr(), "Proxying call");
        match sender.send_request(Request::from_parts(parts, body)).await {
            Ok(res) => res.map(BodyExt::boxed),
            Err(e) => {
                timer.fail();
                grpc_error(&Status::unavailable(format!("backend call failed: {e}")))
            }
        }
    }
}

fn status_for(err: &NetError) -> Status {
    match err {
        NetError::MissingMetadata(_) => Status::invalid_argument(err.to_string()),
        _ => Status::unavailable(err.to_string()),
    }
}

/// Trailers-only gRPC response carrying `status`
pub fn grpc_error(status: &Status) -> Response<ProxyBody> {
    let mut res = Response::new(empty_body());
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if status.add_header(headers).is_err() {
        headers.insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    }
    res
}

/// HTTP/2 server for the gRPC route of the mux
pub struct GrpcProxyServer {
    director: Director,
    conns: ConnectionSet,
}

impl GrpcProxyServer {
    pub fn new(director: Director) -> Self {
        Self {
            director,
            conns: ConnectionSet::new(),
        }
    }
}

#[async_trait]
impl MuxServer for GrpcProxyServer {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn serve(&self, mut listener: RouteListener) -> Result<()> {
        let stopping = self.conns.stopping();
        info!("gRPC proxy server started");
        loop {
            let stream = tokio::select! {
                () = stopping.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(stream) => stream,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            };

            let director = self.director.clone();
            let stop = self.conns.stopping();
            self.conns.spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let director = director.clone();
                    async move { Ok::<_, Infallible>(director.proxy(req).await) }
                });
                let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(e) = res {
                            debug!("gRPC connection error: {:?}", e);
                        }
                    }
                    () = stop.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        let _ = conn.await;
                    }
                }
            });
        }
    }

    async fn shutdown(&self) {
        self.conns.shutdown().await;
        debug!("gRPC proxy server stopped");
    }
}
