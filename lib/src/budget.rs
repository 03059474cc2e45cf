//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// How long to keep polling for a condition, and how long to sleep
/// between probes. Polling always ends, either on success or once the
/// budget is spent.
///
/// A budget is either timed (probe until `timeout` has elapsed) or counted
/// (probe exactly `max_attempts` times, however long each probe takes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Total time to keep polling; nominal for a counted budget
    pub timeout: Duration,
    /// Sleep before each probe
    pub interval: Duration,
    /// Number of probes, for a counted budget
    pub max_attempts: Option<u32>,
}

impl RetryBudget {
    /// Create a budget from a total duration and poll interval.
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            max_attempts: None,
        }
    }

    /// Create a budget from whole seconds.
    pub const fn from_secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }

    /// Create a budget of exactly `attempts` probes, `interval` seconds apart.
    pub const fn counted(attempts: u32, interval: u64) -> Self {
        Self {
            timeout: Duration::from_secs(interval * attempts as u64),
            interval: Duration::from_secs(interval),
            max_attempts: Some(attempts),
        }
    }

    fn has_more(&self, start: Instant, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => start.elapsed() < self.timeout,
        }
    }

    /// Sleep then probe until `probe` returns `Some`, or the budget is spent.
    pub async fn poll_for<T, F, Fut>(&self, mut probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        // A zero interval with instant probes would never let time advance.
        let interval = self.interval.max(Duration::from_millis(1));
        let start = Instant::now();
        let mut attempt = 0u32;
        while self.has_more(start, attempt) {
            tokio::time::sleep(interval).await;
            attempt += 1;
            if let Some(v) = probe().await {
                return Some(v);
            }
            tracing::debug!("Poll attempt {attempt} not ready");
        }
        None
    }

    /// Like [`Self::poll_for`] for a plain boolean condition.
    pub async fn poll<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.poll_for(move || {
            let fut = probe();
            async move { fut.await.then_some(()) }
        })
        .await
        .is_some()
    }
}
