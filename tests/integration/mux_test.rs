use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use std::time::Duration;
use wsnet_common::{HEADER_PROXY_PORT, HEADER_TARGET_HOST, HEADER_TARGET_PORT};
use wsnet_core::mesh::DirectJoiner;
use wsnet_tests::{collect, grpc_backend, grpc_message, http_backend, unix_h2, unix_http1, TestDaemon};

#[tokio::test]
async fn test_grpc_and_http_share_the_socket() {
    let grpc = grpc_backend().await;
    let web = http_backend("web").await;
    let daemon = TestDaemon::start(
        DirectJoiner::new()
            .with_route("grpc-backend", grpc)
            .with_route("web", web),
    )
    .await;
    let socket = daemon.socket_path();

    // gRPC: routed to the director, which dials the proxy port
    let req = Request::post("http://localhost/pkg.Echo/Ping")
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .header(HEADER_TARGET_HOST, "grpc-backend")
        .header(HEADER_TARGET_PORT, "8080")
        .header(HEADER_PROXY_PORT, "9090")
        .body(Full::new(grpc_message(b"ping")))
        .unwrap();
    let (status, headers, body, trailers) = collect(unix_h2(&socket, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-seen-target-port"], "8080");
    assert_eq!(body, grpc_message(b"/pkg.Echo/Ping"));
    assert_eq!(trailers.unwrap()["grpc-status"], "0");

    // Plain HTTP on the same socket: tunnelled to target host and port
    let req = Request::get("/hello")
        .header("host", "app.local")
        .header(HEADER_TARGET_HOST, "web")
        .header(HEADER_TARGET_PORT, "3000")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body, _) = collect(unix_http1(&socket, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-seen-host"], "app.local");
    assert_eq!(&body[..], b"web /hello");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_metadata_is_rejected() {
    let daemon = TestDaemon::start(DirectJoiner::new()).await;
    let socket = daemon.socket_path();

    let req = Request::get("/hello")
        .header("host", "app.local")
        .header(HEADER_TARGET_PORT, "3000")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body, _) = collect(unix_http1(&socket, req).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"missing metadata: x-target-host");

    let req = Request::post("http://localhost/pkg.Echo/Ping")
        .header("content-type", "application/grpc")
        .header(HEADER_TARGET_HOST, "grpc-backend")
        .header(HEADER_TARGET_PORT, "8080")
        .body(Full::new(grpc_message(b"ping")))
        .unwrap();
    let res = unix_h2(&socket, req).await;
    assert_eq!(res.headers()["grpc-status"], "3");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_backend() {
    let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = free.local_addr().unwrap();
    drop(free);

    let daemon = TestDaemon::start(DirectJoiner::new().with_route("gone", dead)).await;
    let socket = daemon.socket_path();

    let req = Request::get("/")
        .header("host", "app.local")
        .header(HEADER_TARGET_HOST, "gone")
        .header(HEADER_TARGET_PORT, "80")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = unix_http1(&socket, req).await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    let req = Request::post("http://localhost/pkg.Echo/Ping")
        .header("content-type", "application/grpc")
        .header(HEADER_TARGET_HOST, "gone")
        .header(HEADER_TARGET_PORT, "80")
        .header(HEADER_PROXY_PORT, "81")
        .body(Full::new(grpc_message(b"ping")))
        .unwrap();
    let res = unix_h2(&socket, req).await;
    assert_eq!(res.headers()["grpc-status"], "14");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_health_and_metrics_routes() {
    let web = http_backend("web").await;
    let daemon = TestDaemon::start(DirectJoiner::new().with_route("web", web)).await;
    let socket = daemon.socket_path();

    let req = Request::get("/daemon/health")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body, _) = collect(unix_http1(&socket, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");

    let req = Request::get("/")
        .header("host", "app.local")
        .header(HEADER_TARGET_HOST, "web")
        .header(HEADER_TARGET_PORT, "80")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = unix_http1(&socket, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    let _ = res.into_body().collect().await.unwrap();

    let req = Request::get("/daemon/metrics")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = tokio::time::timeout(Duration::from_secs(5), unix_http1(&socket, req))
        .await
        .unwrap();
    let (_, _, body, _) = collect(res).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("proxy_requests_total"), "{text}");
    assert!(daemon.server.metrics().snapshot().total_requests >= 1);

    daemon.shutdown().await.unwrap();
}
