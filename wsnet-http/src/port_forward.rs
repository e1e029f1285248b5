//! HTTP port forwarding over the overlay network.
//!
//! Peers send ordinary HTTP/1.x requests to the forwarding port and name the
//! workspace-local port in `x-target-port`. The connection is then handed to
//! that port on the local host, request first, and relayed as raw bytes.

use crate::hijack::{self, Opening, MAX_HEAD_BYTES};
use crate::serve::ConnectionSet;
use bytes::BytesMut;
use hyper::StatusCode;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsnet_common::constants::{DEFAULT_REQUEST_TIMEOUT, SERVICE_PORT_FORWARD};
use wsnet_common::{PortForwardConfig, Result, HEADER_TARGET_PORT};
use wsnet_core::{ConnectionTracker, MeshClient, ServiceTracker, TcpDialer, TrackedStream};
use wsnet_observability::ProxyMetrics;

struct Forwarder {
    local_host: String,
    metrics: ProxyMetrics,
    dial_timeout: Duration,
}

impl Forwarder {
    async fn serve<S>(&self, mut stream: S, stop: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        let opening = tokio::select! {
            () = stop.cancelled() => return,
            res = hijack::read_opening(&mut stream, &mut buf, MAX_HEAD_BYTES) => res,
        };
        let head = match opening {
            Ok(Opening::Http1(head)) => head,
            Ok(Opening::Closed) => return,
            Ok(Opening::Http2) => {
                debug!("Port forward connection spoke HTTP/2");
                return;
            }
            Err(e) => {
                self.metrics.record_failure();
                hijack::write_response(&mut stream, StatusCode::BAD_REQUEST, &e.to_string()).await;
                return;
            }
        };

        let Some(port) = head
            .header(HEADER_TARGET_PORT)
            .and_then(|v| v.parse::<u16>().ok())
        else {
            self.metrics.record_failure();
            hijack::write_response(
                &mut stream,
                StatusCode::BAD_REQUEST,
                "missing or invalid x-target-port header",
            )
            .await;
            return;
        };
        let addr = format!("{}:{}", self.local_host, port);
        debug!(backend = %addr, method = %head.method, path = %head.path, "Forwarding connection");
        hijack::tunnel(
            &TcpDialer,
            &addr,
            buf.freeze(),
            stream,
            self.dial_timeout,
            &self.metrics,
            &stop,
        )
        .await;
    }
}

pub struct PortForwardService {
    mesh: Arc<dyn MeshClient>,
    config: PortForwardConfig,
    connections: ConnectionTracker,
    services: ServiceTracker,
    metrics: ProxyMetrics,
    conns: ConnectionSet,
    cancel: CancellationToken,
    local_addr: OnceLock<String>,
}

impl PortForwardService {
    pub fn new(
        mesh: Arc<dyn MeshClient>,
        config: PortForwardConfig,
        connections: ConnectionTracker,
        services: ServiceTracker,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            mesh,
            config,
            connections,
            services,
            metrics,
            conns: ConnectionSet::new(),
            cancel: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Address the overlay listener is bound to, once started
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.get().map(String::as_str)
    }

    /// Accept forwarding connections until `cancel` fires or [`stop`](Self::stop) is called.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut listener = self.mesh.listen(self.config.listen_port).await?;
        let _ = self.local_addr.set(listener.local_addr());
        info!(addr = %listener.local_addr(), "Port forwarding listening");

        let forwarder = Arc::new(Forwarder {
            local_host: self.config.local_host.clone(),
            metrics: self.metrics.clone(),
            dial_timeout: DEFAULT_REQUEST_TIMEOUT,
        });

        loop {
            let (stream, remote) = tokio::select! {
                () = cancel.cancelled() => break,
                () = self.cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.cancel.is_cancelled() || cancel.is_cancelled() {
                            break;
                        }
                        warn!("Port forward accept failed: {}", e);
                        return Err(e.into());
                    }
                },
            };

            let stream = TrackedStream::new(
                stream,
                remote,
                SERVICE_PORT_FORWARD,
                self.connections.clone(),
                self.services.clone(),
            );
            let forwarder = forwarder.clone();
            let stop = self.conns.stopping();
            self.conns.spawn(async move { forwarder.serve(stream, stop).await });
        }
        debug!("Port forwarding accept loop stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.conns.shutdown().await;
        info!("Port forwarding stopped");
    }
}
