use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// A point in time after which polling gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Sleep for `step`, cut short at the deadline. Returns false once expired.
    pub async fn tick(&self, step: Duration) -> bool {
        if self.expired() {
            return false;
        }
        sleep(step.min(self.remaining())).await;
        true
    }
}

/// Call `probe` every `step` until it yields a value or `budget` runs out.
///
/// The probe always runs at least once.
pub async fn poll_until<T, F, Fut>(budget: Duration, step: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Deadline::after(budget);
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if !deadline.tick(step).await {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_until_returns_first_value() {
        let calls = AtomicU32::new(0);
        let got = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { (n == 3).then_some(n) }
        })
        .await;
        assert_eq!(got, Some(3));
    }

    #[tokio::test]
    async fn test_poll_until_gives_up() {
        let got: Option<()> =
            poll_until(Duration::from_millis(20), Duration::from_millis(5), || async { None }).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_zero_budget_probes_once() {
        let calls = AtomicU32::new(0);
        let _ = poll_until(Duration::ZERO, Duration::from_millis(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None::<()> }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
