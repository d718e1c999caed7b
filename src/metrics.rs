//! Lightweight observability: a `watch`-broadcast metrics snapshot per core,
//! plus a small helper for polling one until it satisfies a condition.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

/// A point-in-time view of the Apply Engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyMetrics {
    pub last_applied: u64,
    pub session_count: usize,
    pub service_count: usize,
    pub last_compacted: u64,
}

/// A point-in-time view of the Client Dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherMetrics {
    pub session_id: Option<u64>,
    pub session_version: u64,
    pub is_open: bool,
    pub current_leader: Option<u64>,
}

/// A handle for polling a metrics channel until it satisfies some condition.
pub struct Wait<T> {
    pub rx: watch::Receiver<T>,
    pub poll_interval: Duration,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Wait<T> {
    pub async fn until<F>(&mut self, mut pred: F, timeout: Duration) -> Result<T, WaitTimeoutError>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.rx.borrow().clone();
            if pred(&current) {
                return Ok(current);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitTimeoutError);
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for metrics condition")]
pub struct WaitTimeoutError;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn until_resolves_once_predicate_is_satisfied() {
        let (tx, rx) = watch::channel(0u64);
        let mut wait = Wait {
            rx,
            poll_interval: Duration::from_millis(1),
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(7);
        });
        let value = wait.until(|v| *v == 7, Duration::from_secs(1)).await.expect("predicate must be satisfied");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn until_times_out_if_predicate_never_holds() {
        let (_tx, rx) = watch::channel(0u64);
        let mut wait = Wait {
            rx,
            poll_interval: Duration::from_millis(1),
        };
        let res = wait.until(|v| *v == 7, Duration::from_millis(20)).await;
        assert!(res.is_err());
    }
}
