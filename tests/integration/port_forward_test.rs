use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wsnet_common::constants::{SERVICE_PORT_FORWARD, SERVICE_SSH};
use wsnet_common::HEADER_TARGET_PORT;
use wsnet_core::mesh::DirectJoiner;
use wsnet_tests::{http_backend, wait_until, TestDaemon};

#[tokio::test]
async fn test_port_forward_reaches_local_port() {
    let web = http_backend("dev-server").await;
    let daemon = TestDaemon::start(DirectJoiner::new()).await;

    let stream = daemon
        .server
        .dial(daemon.server.port_forward_addr().unwrap())
        .await
        .unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::get("/index.html")
        .header("host", "workspace")
        .header(HEADER_TARGET_PORT, web.port().to_string())
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(daemon.server.services().count(SERVICE_PORT_FORWARD), 1);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"dev-server /index.html");

    drop(sender);
    let services = daemon.server.services().clone();
    assert!(wait_until(Duration::from_secs(5), || services.count(SERVICE_PORT_FORWARD) == 0).await);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ssh_is_forwarded_to_local_server() {
    let sshd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sshd_addr = sshd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = sshd.accept().await.unwrap();
        stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    });

    let daemon = TestDaemon::start_with(DirectJoiner::new(), |config| {
        config.ssh.target_addr = sshd_addr;
    })
    .await;

    let mut client = TcpStream::connect(daemon.server.ssh_addr().unwrap()).await.unwrap();
    let mut banner = [0u8; 21];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-OpenSSH_9.6\r\n");
    assert_eq!(daemon.server.services().count(SERVICE_SSH), 1);
    assert_eq!(daemon.server.connections().count(), 1);

    daemon.shutdown().await.unwrap();
}
