//! Retry pacing for calls to external collaborators.
//!
//! [`Backoff`] doubles its delay on every failure and is used by connection
//! drivers so a dead broker doesn't turn into a tight reconnect loop.
//! [`RetryPolicy`] is a bounded attempt budget with a uniformly jittered pause,
//! used for device registration.

use rand::Rng;
use std::ops::Range;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            jitter_ratio: 0.2,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn fail<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = add_jitter(self.current, self.jitter_ratio, rng);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

fn add_jitter<R: Rng + ?Sized>(delay: Duration, ratio: f64, rng: &mut R) -> Duration {
    if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
        return delay;
    }
    delay.mul_f64(1.0 + rng.random_range(0.0..ratio))
}

/// Fixed attempt budget with a uniformly random pause between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Range<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause: Duration::from_secs(1)..Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Pause before retrying after `attempt` (1-based) failed, or `None` when
    /// the budget is spent.
    pub fn pause_after<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if self.pause.start >= self.pause.end {
            return Some(self.pause.start);
        }
        let secs = rng.random_range(self.pause.start.as_secs_f64()..self.pause.end.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }
}
