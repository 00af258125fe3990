//! Token-bucket bandwidth limiting shared by all peer connections.
//!
//! Each direction owns one bucket holding at most one second worth of
//! tokens. A grant that exceeds the available tokens pushes the bucket into
//! debt, so callers are served in the order they asked and later callers wait
//! behind earlier ones.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::ThrottleConfig;

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: bytes_per_sec as f64,
            tokens: bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate == 0.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }

    fn reserve(&mut self, bytes: usize) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill(Instant::now());
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    fn set_rate(&mut self, bytes_per_sec: u64) {
        self.rate = bytes_per_sec as f64;
        self.tokens = self.rate;
        self.last_refill = Instant::now();
    }
}

/// Independent read and write limits; a limit of 0 means unlimited.
#[derive(Debug)]
pub struct ThrottlingManager {
    read: Mutex<TokenBucket>,
    write: Mutex<TokenBucket>,
}

impl ThrottlingManager {
    pub fn new(read_bytes_per_sec: u64, write_bytes_per_sec: u64) -> Self {
        Self {
            read: Mutex::new(TokenBucket::new(read_bytes_per_sec)),
            write: Mutex::new(TokenBucket::new(write_bytes_per_sec)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.read_bytes_per_sec, config.write_bytes_per_sec)
    }

    pub fn set_read_limit(&self, bytes_per_sec: u64) {
        self.read.lock().set_rate(bytes_per_sec);
    }

    pub fn set_write_limit(&self, bytes_per_sec: u64) {
        self.write.lock().set_rate(bytes_per_sec);
    }

    /// Charges `bytes` to the read budget and returns how long to wait first.
    pub fn request_read(&self, bytes: usize) -> Duration {
        self.read.lock().reserve(bytes)
    }

    /// Charges `bytes` to the write budget and returns how long to wait first.
    pub fn request_write(&self, bytes: usize) -> Duration {
        self.write.lock().reserve(bytes)
    }

    pub async fn acquire_read(&self, bytes: usize) {
        let wait = self.request_read(bytes);
        if !wait.is_zero() {
            trace!(bytes, ?wait, "read throttled");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn acquire_write(&self, bytes: usize) {
        let wait = self.request_write(bytes);
        if !wait.is_zero() {
            trace!(bytes, ?wait, "write throttled");
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for ThrottlingManager {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unlimited_never_waits() {
        let throttle = ThrottlingManager::unlimited();
        assert_eq!(throttle.request_read(usize::MAX / 2), Duration::ZERO);
        assert_eq!(throttle.request_write(1 << 30), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_until_budget_spent() {
        let throttle = ThrottlingManager::new(1000, 0);
        assert_eq!(throttle.request_read(600), Duration::ZERO);
        assert_eq!(throttle.request_read(400), Duration::ZERO);
        assert_eq!(throttle.request_read(500), Duration::from_millis(500));
        // queued behind the previous debt
        assert_eq!(throttle.request_read(500), Duration::from_millis(1000));
        // write direction is independent
        assert_eq!(throttle.request_write(10_000), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_taken_from_config() {
        let config = ThrottleConfig {
            read_bytes_per_sec: 0,
            write_bytes_per_sec: 200,
        };
        let throttle = ThrottlingManager::from_config(&config);
        assert_eq!(throttle.request_read(1 << 20), Duration::ZERO);
        assert_eq!(throttle.request_write(200), Duration::ZERO);
        assert_eq!(throttle.request_write(100), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_one_second() {
        let throttle = ThrottlingManager::new(0, 1000);
        assert_eq!(throttle.request_write(1000), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(throttle.request_write(1000), Duration::ZERO);
        assert_eq!(throttle.request_write(100), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_for_the_deficit() {
        let throttle = ThrottlingManager::new(1000, 0);
        throttle.acquire_read(1000).await;

        let start = Instant::now();
        throttle.acquire_read(250).await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_budget() {
        let throttle = Arc::new(ThrottlingManager::new(1000, 0));
        throttle.acquire_read(1000).await;
        let start = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                tokio::spawn(async move { throttle.acquire_read(500).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // 2000 bytes at 1000 B/s
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_at_runtime() {
        let throttle = ThrottlingManager::unlimited();
        throttle.set_read_limit(100);
        assert_eq!(throttle.request_read(100), Duration::ZERO);
        assert_eq!(throttle.request_read(50), Duration::from_millis(500));
        throttle.set_read_limit(0);
        assert_eq!(throttle.request_read(1 << 20), Duration::ZERO);
    }
}
