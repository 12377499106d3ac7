//! Pool-wide shutdown signal

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns the cancellation token handed to every worker, transport pump and
/// router wait, plus the grace period workers get before being killed.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// Token to pass to a blocking wait
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Set the signal; idempotent
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!(grace_secs = self.grace.as_secs(), "Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(3));
        let token = coordinator.token();

        let waiter = tokio::spawn(async move { token.cancelled().await });

        assert!(!coordinator.is_triggered());
        coordinator.trigger();
        coordinator.trigger();
        assert!(coordinator.is_triggered());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert_eq!(coordinator.grace(), Duration::from_secs(3));
    }
}
