//! Plain HTTP/1.1 requests over a stream opened by a [`Dialer`].
//!
//! Overlay peers are only reachable through the overlay dialer, so control
//! plane calls cannot go through a regular pooled client.

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::debug;
use wsnet_common::{NetError, Result};
use wsnet_core::Dialer;

/// Body type of every response produced by this crate
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Dial `addr` and send `req` on a fresh HTTP/1.1 connection.
pub async fn send_request<B>(
    dialer: &dyn Dialer,
    addr: &str,
    req: Request<B>,
    dial_timeout: Duration,
) -> Result<Response<Incoming>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = tokio::time::timeout(dial_timeout, dialer.dial(addr))
        .await
        .map_err(|_| NetError::Timeout(format!("dial {addr}")))?
        .map_err(|source| NetError::Dial {
            addr: addr.to_string(),
            source,
        })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| NetError::Http(format!("handshake with {addr}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Client connection error: {:?}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| NetError::Http(format!("request to {addr}: {e}")))
}

/// Convert a received response into one this crate can return.
pub fn into_proxy_response(res: Response<Incoming>) -> Response<ProxyBody> {
    res.map(BodyExt::boxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use wsnet_core::TcpDialer;

    #[tokio::test]
    async fn test_send_request_over_dialer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|req: Request<Incoming>| async move {
                let status = if req.headers().contains_key("authorization") {
                    StatusCode::OK
                } else {
                    StatusCode::UNAUTHORIZED
                };
                let mut res = Response::new(Empty::<Bytes>::new());
                *res.status_mut() = status;
                Ok::<_, Infallible>(res)
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let req = Request::get("/heartbeat")
            .header("host", "runner")
            .header("authorization", "Bearer key")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let res = send_request(&TcpDialer, &addr, req, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let req = Request::get("/").body(Empty::<Bytes>::new()).unwrap();
        let err = send_request(&TcpDialer, &addr, req, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Dial { .. }));
    }
}
