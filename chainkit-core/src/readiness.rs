//! One-shot readiness signal
//!
//! Fired once by the bootstrap task when every entry peer has been tried.
//! Waiters that arrive before the signal park until it fires; waiters that
//! arrive after return immediately.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to a single one-shot signal
#[derive(Clone, Debug)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal has fired
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fires_exactly_once() {
        let ready = Readiness::new();
        assert!(!ready.is_ready());

        assert!(ready.fire());
        assert!(!ready.fire());
        assert!(ready.is_ready());
    }

    #[tokio::test]
    async fn test_releases_all_waiters() {
        let ready = Readiness::new();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let ready = ready.clone();
                tokio::spawn(async move { ready.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        ready.fire();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter was not released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let ready = Readiness::new();
        ready.fire();

        timeout(Duration::from_millis(100), ready.wait())
            .await
            .expect("late waiter blocked");
    }

    #[tokio::test]
    async fn test_unfired_signal_blocks() {
        let ready = Readiness::new();
        assert!(timeout(Duration::from_millis(50), ready.wait()).await.is_err());
    }
}
