//! Sliding-window limiter for outbound API requests.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Window used for the per-minute request budget.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `max_requests` acquisitions in any `window`.
///
/// Excess callers are delayed until the oldest request leaves the window;
/// nothing is ever rejected.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, RATE_LIMIT_WINDOW)
    }

    /// Wait until a request may be sent, then claim the slot.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                while issued
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= self.window)
                {
                    issued.pop_front();
                }

                if issued.len() < self.max_requests {
                    issued.push_back(now);
                    return;
                }

                match issued.front() {
                    Some(&oldest) => oldest + self.window,
                    None => continue,
                }
            };

            tracing::debug!(
                wait_ms = wait_until
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64,
                "Rate limit reached, waiting for window"
            );
            tokio::time::sleep_until(wait_until).await;
        }
    }
}
