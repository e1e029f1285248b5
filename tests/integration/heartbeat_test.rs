use hyper::StatusCode;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use wsnet_common::HeartbeatConfig;
use wsnet_core::mesh::{DirectJoiner, PeerStatus};
use wsnet_tests::{runner_backend, wait_until, TestDaemon};

#[tokio::test]
async fn test_heartbeats_follow_active_connections() {
    let (runner, seen) = runner_backend(StatusCode::OK, "").await;
    let sshd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sshd_addr = sshd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = sshd.accept().await {
            tokio::spawn(async move {
                // Hold the session until the client goes away
                let mut buf = [0u8; 64];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });

    let daemon = TestDaemon::start_with(
        DirectJoiner::new().with_peer(PeerStatus::new("runner-1", "eu-runner"), Some(runner)),
        |config| {
            config.presence.interval = Duration::from_millis(50);
            config.ssh.target_addr = sshd_addr;
        },
    )
    .await;

    // Idle workspace: nothing is sent
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(seen.lock().unwrap().is_empty());

    // An open SSH session keeps the workspace alive
    let client = TcpStream::connect(daemon.server.ssh_addr().unwrap()).await.unwrap();
    let arrived = wait_until(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()).await;
    assert!(arrived, "no heartbeat while a session was open");
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].path, "/devpod/proj/ws/heartbeat");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer test-key"));
    }

    // Session closed: heartbeats stop again
    drop(client);
    let services = daemon.server.services().clone();
    assert!(wait_until(Duration::from_secs(5), || services.total() == 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = seen.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(seen.lock().unwrap().len(), settled);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_failures_are_not_fatal() {
    let (runner, seen) = runner_backend(StatusCode::INTERNAL_SERVER_ERROR, "down").await;
    let sshd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sshd_addr = sshd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = sshd.accept().await {
            held.push(stream);
        }
    });

    let daemon = TestDaemon::start_with(
        DirectJoiner::new().with_peer(PeerStatus::new("runner-1", "eu-runner"), Some(runner)),
        |config| {
            config.presence.interval = Duration::from_millis(50);
            config.ssh.target_addr = sshd_addr;
        },
    )
    .await;

    let _client = TcpStream::connect(daemon.server.ssh_addr().unwrap()).await.unwrap();
    let repeated = wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 3).await;
    assert!(repeated, "heartbeat loop stopped after a failure");
    assert!(daemon.server.health().is_ok());

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_session_is_evicted_and_heartbeats_stop() {
    let (runner, seen) = runner_backend(StatusCode::OK, "").await;
    let sshd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sshd_addr = sshd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = sshd.accept().await {
            held.push(stream);
        }
    });

    let daemon = TestDaemon::start_with(
        DirectJoiner::new().with_peer(PeerStatus::new("runner-1", "eu-runner"), Some(runner)),
        |config| {
            config.presence.interval = Duration::from_millis(50);
            config.heartbeat = HeartbeatConfig {
                interval: Duration::from_millis(100),
                timeout: Duration::from_millis(300),
            };
            config.ssh.target_addr = sshd_addr;
        },
    )
    .await;

    // Connected but silent: the sweep must drop it
    let mut client = TcpStream::connect(daemon.server.ssh_addr().unwrap()).await.unwrap();
    let services = daemon.server.services().clone();
    assert!(wait_until(Duration::from_secs(5), || services.total() == 1).await);
    assert!(wait_until(Duration::from_secs(5), || services.total() == 0).await);
    assert_eq!(daemon.server.connections().count(), 0);

    let mut buf = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;
    assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))), "evicted session stayed open");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = seen.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(seen.lock().unwrap().len(), settled);

    daemon.shutdown().await.unwrap();
}
