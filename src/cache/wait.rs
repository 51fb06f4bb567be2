//! Bounded follower wait on a leader's control key.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::coordinator::InFlightCoordinator;

/// Why a follower stopped waiting before the leader finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The retry budget ran out with the control key still in progress.
    TimedOut,
    /// The caller's token was cancelled.
    Cancelled,
}

/// Fixed-interval polling of a control key.
///
/// The budget is `ceil(timeout / poll_interval)` re-checks. Polling at a
/// fixed interval keeps the worst-case wait predictable.
#[derive(Debug, Clone, Copy)]
pub struct WaitStrategy {
    poll_interval: Duration,
    timeout: Duration,
}

impl WaitStrategy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of sleeps a follower may perform before giving up.
    pub fn max_retries(&self) -> u64 {
        let poll = self.poll_interval.as_millis().max(1);
        u64::try_from(self.timeout.as_millis().div_ceil(poll)).unwrap_or(u64::MAX)
    }

    /// Suspends until `control_key` stops reading in-progress.
    ///
    /// Cancellation is observed at every sleep, so a cancelled caller returns
    /// promptly with [`WaitError::Cancelled`] rather than the timeout.
    pub async fn wait(
        &self,
        coordinator: &InFlightCoordinator,
        control_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let mut remaining = self.max_retries();

        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            if !coordinator.is_in_progress(control_key).await {
                return Ok(());
            }
            if remaining == 0 {
                debug!(key = control_key, "wait budget exhausted");
                return Err(WaitError::TimedOut);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            remaining -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::cache::{CacheStore, MemoryStore};

    const POLL: Duration = Duration::from_millis(10);

    fn setup() -> (Arc<MemoryStore>, InFlightCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = InFlightCoordinator::new(store.clone(), Duration::from_secs(60));
        (store, coordinator)
    }

    #[test]
    fn max_retries_rounds_up() {
        let w = WaitStrategy::new(Duration::from_millis(300), Duration::from_secs(1));
        assert_eq!(w.max_retries(), 4);
        let w = WaitStrategy::new(POLL, Duration::from_secs(5));
        assert_eq!(w.max_retries(), 500);
        let w = WaitStrategy::new(POLL, Duration::ZERO);
        assert_eq!(w.max_retries(), 0);
    }

    #[test]
    fn max_retries_saturates() {
        let w = WaitStrategy::new(Duration::from_millis(1), Duration::MAX);
        assert_eq!(w.max_retries(), u64::MAX);
    }

    #[tokio::test]
    async fn returns_immediately_when_idle() {
        let (_, c) = setup();
        let w = WaitStrategy::new(POLL, Duration::from_secs(1));
        let start = Instant::now();
        w.wait(&c, "k", &CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() < POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_while_in_progress() {
        let (_, c) = setup();
        c.claim("k").await;
        let w = WaitStrategy::new(POLL, Duration::from_millis(100));

        let start = Instant::now();
        let res = w.wait(&c, "k", &CancellationToken::new()).await;
        assert_eq!(res, Err(WaitError::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_after_release() {
        let (store, c) = setup();
        c.claim("k").await;

        let leader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            store.set("k", "0", Duration::from_secs(60)).await.unwrap();
        });

        let w = WaitStrategy::new(POLL, Duration::from_secs(5));
        let start = Instant::now();
        w.wait(&c, "k", &CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        leader.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_beats_timeout() {
        let (_, c) = setup();
        c.claim("k").await;
        let w = WaitStrategy::new(POLL, Duration::from_secs(60));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let res = w.wait(&c, "k", &token).await;
        assert_eq!(res, Err(WaitError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn already_cancelled_returns_cancelled() {
        let (_, c) = setup();
        c.claim("k").await;
        let w = WaitStrategy::new(POLL, Duration::from_secs(1));
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(w.wait(&c, "k", &token).await, Err(WaitError::Cancelled));
    }
}
