//! Requests to the control-plane runner peer.
//!
//! The runner is the first online overlay peer whose hostname ends with the
//! runner suffix. Its HTTP endpoints live under
//! `/devpod/<project>/<workspace>/` and expect the workspace access key as a
//! bearer token.

use crate::client;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONNECTION, HOST};
use hyper::{HeaderMap, Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wsnet_common::constants::DEFAULT_REQUEST_TIMEOUT;
use wsnet_common::{NetError, Result, RUNNER_SUFFIX};
use wsnet_core::mesh::{find_runner, peer_fqdn};
use wsnet_core::MeshClient;

/// Port runner endpoints are served on
const RUNNER_HTTP_PORT: u16 = 80;

#[derive(Clone)]
pub struct ControlPlane {
    mesh: Arc<dyn MeshClient>,
    access_key: String,
    project: String,
    workspace: String,
    request_timeout: Duration,
}

impl ControlPlane {
    pub fn new(
        mesh: Arc<dyn MeshClient>,
        access_key: impl Into<String>,
        project: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            mesh,
            access_key: access_key.into(),
            project: project.into(),
            workspace: workspace.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overlay name of the current runner peer
    pub async fn runner(&self) -> Result<String> {
        let netmap = self.mesh.status().await?;
        find_runner(&netmap.peers, RUNNER_SUFFIX)
            .map(|peer| peer_fqdn(peer, self.mesh.domain()))
            .ok_or(NetError::NoRunner)
    }

    /// Path of a workspace-scoped runner endpoint
    pub fn path(&self, leaf: &str) -> String {
        format!("/devpod/{}/{}/{}", self.project, self.workspace, leaf)
    }

    /// Full URL of a workspace-scoped endpoint on `runner`
    pub fn url(&self, runner: &str, leaf: &str) -> String {
        format!("http://{}{}", runner, self.path(leaf))
    }

    /// Send an authenticated request to the runner's `leaf` endpoint.
    ///
    /// `headers` are copied onto the request except for `Host`,
    /// `Authorization` and `Connection`.
    pub async fn send<B>(
        &self,
        method: Method,
        leaf: &str,
        headers: &HeaderMap,
        body: B,
    ) -> Result<Response<Incoming>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let runner = self.runner().await?;
        let addr = format!("{runner}:{RUNNER_HTTP_PORT}");

        let mut builder = Request::builder().method(method).uri(self.path(leaf));
        for (name, value) in headers {
            if name != HOST && name != AUTHORIZATION && name != CONNECTION {
                builder = builder.header(name, value);
            }
        }
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.access_key))
            .map_err(|e| NetError::Config(format!("access key is not a valid header: {e}")))?;
        let req = builder
            .header(HOST, runner.as_str())
            .header(AUTHORIZATION, bearer)
            .body(body)
            .map_err(|e| NetError::Http(e.to_string()))?;

        debug!(url = %self.url(&runner, leaf), "Control plane request");
        tokio::time::timeout(
            self.request_timeout,
            client::send_request(self.mesh.as_ref(), &addr, req, self.request_timeout),
        )
        .await
        .map_err(|_| NetError::Timeout(format!("request to {}", self.url(&runner, leaf))))?
    }
}
