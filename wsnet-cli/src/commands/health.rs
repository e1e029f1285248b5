//! Health subcommand implementation

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Args;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use wsnet_common::SOCKET_FILE;
use wsnet_core::{check_health, Transport, UnixTransport};
use wsnet_http::proxy::HEALTH_PATH;

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Rendezvous socket of the daemon
    #[arg(long, env = "WSNET_SOCKET")]
    socket: Option<PathBuf>,

    /// Daemon root directory, used when --socket is not given
    #[arg(long, default_value = "/var/run/devpod", env = "WSNET_ROOT_DIR")]
    root_dir: PathBuf,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: HealthArgs) -> Result<()> {
    wsnet_observability::init_minimal_logging();

    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| args.root_dir.join(SOCKET_FILE));
    let transport = UnixTransport::new(&socket);

    let status = check_health(&transport, "").await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "transport: {} healthy: {} latency: {:?}",
            status.transport, status.healthy, status.latency
        );
    }
    if let Some(error) = &status.error {
        bail!("cannot reach {}: {}", socket.display(), error);
    }

    let timeout = Duration::from_secs(args.timeout);
    let (code, body) = tokio::time::timeout(timeout, probe(&transport))
        .await
        .context("health request timed out")??;
    println!("daemon: {} {}", code, body.trim());
    if code != StatusCode::OK {
        bail!("daemon reported {}", code);
    }
    Ok(())
}

/// `GET /daemon/health` over the rendezvous socket
async fn probe(transport: &dyn Transport) -> Result<(StatusCode, String)> {
    let stream = transport.dial("").await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Health connection error: {:?}", e);
        }
    });

    let req = Request::get(HEALTH_PATH)
        .header("host", "localhost")
        .body(Empty::<Bytes>::new())?;
    let res = sender.send_request(req).await?;
    let code = res.status();
    let body = res.into_body().collect().await?.to_bytes();
    Ok((code, String::from_utf8_lossy(&body).into_owned()))
}
