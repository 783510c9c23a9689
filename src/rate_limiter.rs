//! Sliding-window request limiter, one instance per connection.
//!
//! The limiter lives on the connection task and is never shared, so it
//! needs no locking. Windows are tracked per action name: when a window is
//! older than the configured width it resets, otherwise the counter must
//! stay under the maximum.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: HashMap<&'static str, Window>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: HashMap::new(),
        }
    }

    /// Defaults from config: 100 requests per 60 s.
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Record one request for `action`; false means the caller must reject
    /// the frame with `RATE_LIMIT`.
    pub fn allow(&mut self, action: &'static str) -> bool {
        self.allow_at(action, Instant::now())
    }

    fn allow_at(&mut self, action: &'static str, now: Instant) -> bool {
        let window = self.windows.entry(action).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.window {
            window.count = 0;
            window.started = now;
        }

        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }
}
