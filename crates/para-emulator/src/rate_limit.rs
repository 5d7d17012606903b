//! Sliding-window throttle for registration API calls.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Allows at most `limit` acquisitions in any trailing one-second window.
///
/// Waiters queue on an async mutex, so they are served roughly in the order
/// they arrived. The timestamp window has its own lock, held only while it is
/// pruned and appended to.
#[derive(Debug)]
pub struct RateLimiter {
    limit: Option<usize>,
    turnstile: tokio::sync::Mutex<()>,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            limit: Some(per_second.max(1) as usize),
            turnstile: tokio::sync::Mutex::new(()),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// A limiter that never blocks.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            turnstile: tokio::sync::Mutex::new(()),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_limit(per_second: Option<u32>) -> Self {
        match per_second {
            Some(limit) => Self::new(limit),
            None => Self::unlimited(),
        }
    }

    /// Wait until a call is allowed, then record it.
    pub async fn acquire(&self) {
        let Some(limit) = self.limit else {
            return;
        };
        let _turn = self.turnstile.lock().await;
        loop {
            let wait = {
                let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) >= WINDOW)
                {
                    calls.pop_front();
                }
                if calls.len() < limit {
                    calls.push_back(now);
                    return;
                }
                let oldest = calls.front().copied().unwrap_or(now);
                WINDOW.saturating_sub(now.duration_since(oldest))
            };
            tokio::time::sleep(wait).await;
        }
    }
}
