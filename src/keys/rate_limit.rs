//! Per-key request rate limiting.
//!
//! The limiter sits behind a trait so a multi-process deployment can swap in
//! a shared backend; the in-process implementation is a bounded LRU of
//! sliding-window timestamp queues.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::RateLimitConfig;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// Over the limit; `retry_after` is when the oldest request leaves the window.
    Limited { retry_after: Duration },
}

/// Backend-agnostic rate limiter seam.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key_id: Uuid, limit: RateLimitConfig) -> RateLimitDecision;
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
    last_touched: Instant,
}

/// In-process sliding-window limiter, bounded to `capacity` tracked keys.
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<Uuid, Window>>,
    capacity: usize,
}

impl SlidingWindowLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, key_id: Uuid, limit: RateLimitConfig) -> RateLimitDecision {
        let window = Duration::from_millis(limit.window_ms.max(1));
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        // Bound the map: evict the least recently touched key.
        if !windows.contains_key(&key_id) && windows.len() >= self.capacity {
            if let Some(oldest) = windows
                .iter()
                .min_by_key(|(_, w)| w.last_touched)
                .map(|(k, _)| *k)
            {
                windows.remove(&oldest);
            }
        }

        let entry = windows.entry(key_id).or_insert_with(|| Window {
            hits: VecDeque::new(),
            last_touched: now,
        });
        entry.last_touched = now;
        while let Some(front) = entry.hits.front() {
            if now.duration_since(*front) >= window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }

        if entry.hits.len() >= limit.max_requests as usize {
            let retry_after = entry
                .hits
                .front()
                .map(|front| window.saturating_sub(now.duration_since(*front)))
                .unwrap_or(window);
            return RateLimitDecision::Limited { retry_after };
        }

        entry.hits.push_back(now);
        RateLimitDecision::Allowed
    }
}
