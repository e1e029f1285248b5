//! Primary transport with a secondary used on any dial error

use super::Transport;
use crate::stream::BoxedStream;
use async_trait::async_trait;
use std::io;
use tracing::debug;

pub struct FallbackTransport {
    primary: Box<dyn Transport>,
    fallback: Box<dyn Transport>,
}

impl FallbackTransport {
    pub fn new(primary: Box<dyn Transport>, fallback: Box<dyn Transport>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    async fn dial(&self, target: &str) -> io::Result<BoxedStream> {
        match self.primary.dial(target).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(
                    primary = self.primary.kind(),
                    fallback = self.fallback.kind(),
                    error = %e,
                    "Primary transport failed, trying fallback"
                );
                self.fallback.dial(target).await
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        let primary = self.primary.close().await;
        let fallback = self.fallback.close().await;
        primary.and(fallback)
    }

    fn kind(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeTransport {
        fail: bool,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn dial(&self, _target: &str) -> io::Result<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                let (a, _b) = tokio::io::duplex(8);
                Ok(Box::pin(a))
            }
        }
    }

    fn fake(fail: bool) -> (Box<dyn Transport>, Arc<AtomicUsize>) {
        let dials = Arc::new(AtomicUsize::new(0));
        (
            Box::new(FakeTransport {
                fail,
                dials: dials.clone(),
            }),
            dials,
        )
    }

    #[tokio::test]
    async fn test_primary_failure_uses_fallback_once() {
        let (primary, primary_dials) = fake(true);
        let (fallback, fallback_dials) = fake(false);
        let transport = FallbackTransport::new(primary, fallback);

        assert!(transport.dial("x").await.is_ok());
        assert_eq!(primary_dials.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let (primary, _) = fake(false);
        let (fallback, fallback_dials) = fake(false);
        let transport = FallbackTransport::new(primary, fallback);

        assert!(transport.dial("x").await.is_ok());
        assert_eq!(fallback_dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_both_failing_reports_fallback_error() {
        let (primary, _) = fake(true);
        let (fallback, _) = fake(true);
        let transport = FallbackTransport::new(primary, fallback);
        assert!(transport.dial("x").await.is_err());
        assert_eq!(transport.kind(), "fallback");
    }
}
