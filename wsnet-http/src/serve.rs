//! Connection bookkeeping shared by the proxy servers

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Open connections of one server and the signal asking them to wind down
#[derive(Clone, Default)]
pub(crate) struct ConnectionSet {
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fires when the owning server starts shutting down
    pub(crate) fn stopping(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Signal every connection and wait until all of them have ended.
    pub(crate) async fn shutdown(&self) {
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_connections() {
        let set = ConnectionSet::new();
        let stop = set.stopping();
        let (tx, rx) = tokio::sync::oneshot::channel();
        set.spawn(async move {
            stop.cancelled().await;
            let _ = tx.send(());
        });
        assert_eq!(set.tasks.len(), 1);

        set.shutdown().await;
        assert!(set.stopping().is_cancelled());
        assert!(rx.await.is_ok());
        assert_eq!(set.tasks.len(), 0);
    }
}
