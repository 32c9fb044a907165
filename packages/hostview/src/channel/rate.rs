//! Sliding-window rate limiting for incoming channel messages.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Width of the sliding window.
const WINDOW: Duration = Duration::from_secs(1);

/// Counts message arrivals over the most recent one-second interval.
/// A limit of `None` (or zero) disables limiting.
pub struct RateLimiter {
    limit: Option<u32>,
    arrivals: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit: limit.filter(|l| *l > 0),
            arrivals: VecDeque::new(),
        }
    }

    /// Record an arrival at `now`. Returns `false` when the message must be
    /// dropped because the window already holds `limit` arrivals.
    pub fn allow(&mut self, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };
        while let Some(front) = self.arrivals.front() {
            if now.duration_since(*front) >= WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        if self.arrivals.len() >= limit as usize {
            return false;
        }
        self.arrivals.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_allows() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(None);
        for _ in 0..10_000 {
            assert!(rl.allow(now));
        }
        let mut rl = RateLimiter::new(Some(0));
        assert!(rl.allow(now));
        assert!(rl.allow(now));
    }

    #[test]
    fn caps_a_same_instant_burst() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(Some(3));
        assert!(rl.allow(now));
        assert!(rl.allow(now));
        assert!(rl.allow(now));
        assert!(!rl.allow(now));
        assert!(!rl.allow(now));
    }

    #[test]
    fn window_slides_after_one_second() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(Some(3));
        for _ in 0..3 {
            assert!(rl.allow(start));
        }
        assert!(!rl.allow(start));
        // 1.1s later the burst has left the window.
        assert!(rl.allow(start + Duration::from_millis(1100)));
    }

    #[test]
    fn at_most_limit_in_any_window() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(Some(5));
        let mut allowed = Vec::new();
        // 20 arrivals spread over 2 seconds.
        for i in 0..20u64 {
            let t = start + Duration::from_millis(i * 100);
            if rl.allow(t) {
                allowed.push(t);
            }
        }
        for (i, t) in allowed.iter().enumerate() {
            let in_window = allowed[i..]
                .iter()
                .take_while(|u| u.duration_since(*t) < WINDOW)
                .count();
            assert!(in_window <= 5, "window starting at arrival {i} holds {in_window}");
        }
    }
}
