use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Sliding-window limiter: at most `limit` acquisitions in any `window`.
///
/// The lock is held while waiting so concurrent callers queue up behind the
/// one that is sleeping instead of all waking at the same instant.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute as usize, Duration::from_secs(60))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            requests: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn acquire(&self) {
        let mut q = self.requests.lock().await;
        self.evict(&mut q, Instant::now());

        if q.len() >= self.limit {
            if let Some(&oldest) = q.front() {
                let wait = self.window.saturating_sub(oldest.elapsed());
                if wait > Duration::ZERO {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    sleep(wait).await;
                }
            }
            self.evict(&mut q, Instant::now());
        }

        q.push_back(Instant::now());
    }

    /// Acquisitions still counted inside the current window.
    pub async fn in_window(&self) -> usize {
        let mut q = self.requests.lock().await;
        self.evict(&mut q, Instant::now());
        q.len()
    }

    fn evict(&self, q: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&t) = q.front() {
            if now.saturating_duration_since(t) >= self.window {
                q.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn blocks_until_oldest_request_leaves_window() {
        let rl = RateLimiter::per_minute(3);
        let t0 = Instant::now();

        rl.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        rl.acquire().await;
        rl.acquire().await;
        assert_eq!(rl.in_window().await, 3);

        rl.acquire().await;
        assert_eq!(t0.elapsed(), Duration::from_secs(60));
        assert_eq!(rl.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_is_clamped_to_one() {
        let rl = RateLimiter::new(0, Duration::from_secs(1));
        let t0 = Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        assert_eq!(rl.limit(), 1);
        assert_eq!(t0.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_limit() {
        let window = Duration::from_secs(10);
        let rl = std::sync::Arc::new(RateLimiter::new(3, window));
        let t0 = Instant::now();

        let tasks = (0..7).map(|_| {
            let rl = rl.clone();
            tokio::spawn(async move {
                rl.acquire().await;
                t0.elapsed()
            })
        });
        let mut granted: Vec<Duration> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        granted.sort();

        let early = granted.iter().filter(|t| **t < window).count();
        assert_eq!(early, 3);
        for t in &granted {
            let overlapping = granted
                .iter()
                .filter(|u| *u <= t && t.saturating_sub(**u) < window)
                .count();
            assert!(overlapping <= 3, "{overlapping} grants inside one window at {t:?}");
        }
        assert_eq!(granted.last(), Some(&Duration::from_secs(20)));
        assert!(rl.in_window().await <= rl.limit());
    }
}
