use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Sliding-window request limiter shared by clones
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
}

#[derive(Debug)]
struct RateLimiterInner {
    max_requests: u32,
    window: Duration,
    timestamps: Vec<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterInner {
                max_requests,
                window,
                timestamps: Vec::new(),
            })),
        }
    }

    /// Wait until a request slot is free, then take it
    pub async fn acquire(&self) {
        loop {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let window = inner.window;
            inner.timestamps.retain(|&ts| now.duration_since(ts) < window);
            if (inner.timestamps.len() as u32) < inner.max_requests {
                inner.timestamps.push(now);
                return;
            }
            let wait = window.saturating_sub(now.duration_since(inner.timestamps[0]));
            drop(inner);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Backoff before retry `attempt` (0-based): 500ms, 1s, 2s, ...
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_within_budget() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_full() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(2000));
    }
}
