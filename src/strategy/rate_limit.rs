//! Sliding-window order rate limiter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// At most `max_events` acquisitions within any `window`
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_events: usize,
    window: Duration,
    events: VecDeque<Instant>,
    rejected: u64,
}

impl SlidingWindowLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: VecDeque::with_capacity(max_events),
            rejected: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.events.len() >= self.max_events {
            self.rejected += 1;
            return false;
        }
        self.events.push_back(now);
        true
    }

    /// Slots left in the current window
    pub fn available_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.max_events.saturating_sub(self.events.len())
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_within_window() {
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(100)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(200)));
        assert_eq!(limiter.rejected(), 1);

        // First slot frees once it leaves the window
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(1000)));
        assert_eq!(limiter.available_at(t0 + Duration::from_millis(1000)), 0);
        assert_eq!(limiter.available_at(t0 + Duration::from_millis(2100)), 2);
    }
}
