use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wsnet::{NetError, Server};
use wsnet_core::mesh::{DirectJoiner, PeerStatus};
use wsnet_core::{check_health, UnixTransport};
use wsnet_tests::{test_config, wait_until, TestDaemon};

#[tokio::test]
async fn test_start_and_stop() {
    let daemon = TestDaemon::start(
        DirectJoiner::new().with_peer(PeerStatus::new("runner-1", "eu-runner"), None),
    )
    .await;
    let socket = daemon.socket_path();
    let root = daemon.server.config().root_dir.clone();

    assert!(daemon.server.health().is_ok());
    let status = check_health(&UnixTransport::new(&socket), "").await;
    assert!(status.healthy, "{:?}", status.error);
    assert_eq!(status.transport, "unix");

    // The initial topology is persisted
    let snapshot = root.join("netmap.json");
    assert!(wait_until(Duration::from_secs(5), || snapshot.exists()).await);
    let peers = daemon.server.peers();
    assert!(peers.iter().any(|p| p.id == "runner-1"));

    daemon.shutdown().await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let daemon = TestDaemon::start(DirectJoiner::new()).await;
    let server = daemon.server.clone();
    let socket = daemon.socket_path();

    tokio::join!(server.stop(), server.stop());
    assert!(!socket.exists());

    daemon.shutdown().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let socket = config.proxy_config().socket_path();
    std::fs::write(&socket, b"stale").unwrap();

    let server = Arc::new(Server::new(config, Arc::new(DirectJoiner::new())).unwrap());
    let cancel = CancellationToken::new();
    let task = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.start(cancel).await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            std::os::unix::net::UnixStream::connect(&socket).is_ok()
        })
        .await
    );

    cancel.cancel();
    task.await.unwrap().unwrap();
    server.stop().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.access_key.clear();
    assert!(matches!(
        Server::new(config, Arc::new(DirectJoiner::new())),
        Err(NetError::Config(_))
    ));

    let mut config = test_config(root.path());
    config.workspace_host = "ws.proj.ts".into();
    assert!(Server::new(config, Arc::new(DirectJoiner::new())).is_err());
}
