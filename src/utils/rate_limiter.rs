// Sliding-window rate limiter for outbound LLM requests.
// Shared across all impact-analyzer workers; acquisition blocks until a
// slot frees, it never errors.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Caps requests at `max_requests` per sliding `window`.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests: max_requests.max(1), window, timestamps: Mutex::new(VecDeque::new()) }
    }

    /// Limiter with the default 60-second window
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Block until a request slot is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();

                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) >= self.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }

                if timestamps.len() < self.max_requests {
                    timestamps.push_back(now);
                    return;
                }

                // Oldest entry decides when the next slot opens
                self.window - now.duration_since(*timestamps.front().expect("non-empty"))
            };

            tracing::debug!("Rate limit saturated, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Slots currently in use (for tests and diagnostics)
    pub async fn in_flight(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_up_to_cap_without_blocking() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.in_flight().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(100));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        // Third acquisition had to wait for the first slot to expire
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn window_never_exceeds_cap_under_burst() {
        let limiter = std::sync::Arc::new(SlidingWindowLimiter::new(10, Duration::from_millis(50)));
        let mut handles = Vec::new();
        for _ in 0..30 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(limiter.in_flight().await <= 10);
    }
}
