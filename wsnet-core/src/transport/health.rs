//! Reachability probe for client transports

use super::Transport;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Label reported by [`Transport::kind`]
    pub transport: String,
    pub latency: Duration,
    pub error: Option<String>,
}

/// Dial `target` once through `transport` and report how it went.
pub async fn check_health(transport: &dyn Transport, target: &str) -> HealthStatus {
    let started = Instant::now();
    let result = transport.dial(target).await;
    let latency = started.elapsed();

    match result {
        Ok(mut stream) => {
            let _ = stream.shutdown().await;
            HealthStatus {
                healthy: true,
                transport: transport.kind().to_string(),
                latency,
                error: None,
            }
        }
        Err(e) => HealthStatus {
            healthy: false,
            transport: transport.kind().to_string(),
            latency,
            error: Some(e.to_string()),
        },
    }
}
