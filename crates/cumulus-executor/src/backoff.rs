use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Doubling delay, capped. Used between status polls.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Delay before re-submitting after `retry_count` earlier retries.
pub fn retry_delay(base: Duration, retry_count: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap.max(base))
}

/// `now + after`, or `None` when that instant cannot be represented.
pub fn deadline_after(after: Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

/// Resolves at `deadline`. Without a deadline it never resolves.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
