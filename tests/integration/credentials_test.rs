use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, StatusCode};
use wsnet_core::mesh::{DirectJoiner, PeerStatus};
use wsnet_tests::{collect, runner_backend, unix_http1, TestDaemon};

#[tokio::test]
async fn test_credentials_are_relayed_to_runner() {
    let (runner, seen) = runner_backend(StatusCode::OK, "username=dev\npassword=secret\n").await;
    let daemon = TestDaemon::start(
        DirectJoiner::new()
            .with_peer(PeerStatus::new("laptop-1", "laptop"), None)
            .with_peer(PeerStatus::new("runner-1", "eu-runner"), Some(runner)),
    )
    .await;

    let req = Request::post("/git-credentials")
        .header("host", "localhost")
        .header("authorization", "Bearer should-be-replaced")
        .body(Full::new(Bytes::from_static(b"protocol=https\nhost=github.com\n")))
        .unwrap();
    let (status, _, body, _) = collect(unix_http1(&daemon.socket_path(), req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"username=dev\npassword=secret\n");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/devpod/proj/ws/workspace-git-credentials");
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(&seen[0].body[..], b"protocol=https\nhost=github.com\n");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runner_status_is_passed_through() {
    let (runner, _) = runner_backend(StatusCode::NOT_FOUND, "no credentials").await;
    let daemon = TestDaemon::start(
        DirectJoiner::new().with_peer(PeerStatus::new("runner-1", "us-runner"), Some(runner)),
    )
    .await;

    let req = Request::get("/git-credentials")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body, _) = collect(unix_http1(&daemon.socket_path(), req).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"no credentials");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_runner_is_ignored() {
    let (runner, seen) = runner_backend(StatusCode::OK, "unused").await;
    let mut offline = PeerStatus::new("runner-1", "eu-runner");
    offline.online = false;
    let daemon = TestDaemon::start(DirectJoiner::new().with_peer(offline, Some(runner))).await;

    let req = Request::get("/git-credentials")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body, _) = collect(unix_http1(&daemon.socket_path(), req).await).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&body[..], b"no active runner found");
    assert!(seen.lock().unwrap().is_empty());

    daemon.shutdown().await.unwrap();
}
