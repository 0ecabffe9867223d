//! Sliding-window rate limiting for gateway requests.
//!
//! The remote endpoint is rate-limited; every request first waits for room
//! in the window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Sliding-window rate limiter.
pub struct RateLimiter {
    /// Maximum requests per window.
    max_requests: u32,
    window: Duration,
    /// Timestamps of recent requests.
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// # Arguments
    /// * `max_requests` - Maximum requests per window (0 disables limiting)
    /// * `window` - Window length
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    pub fn can_send(&self) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        self.cleanup_old_timestamps();
        self.timestamps.lock().len() < self.max_requests as usize
    }

    /// Record a request.
    pub fn record_send(&self) {
        if self.max_requests == 0 {
            return;
        }
        self.cleanup_old_timestamps();

        let mut timestamps = self.timestamps.lock();
        timestamps.push_back(Instant::now());

        if timestamps.len() >= self.max_requests as usize {
            warn!(
                count = timestamps.len(),
                max = self.max_requests,
                "Approaching gateway rate limit"
            );
        }
    }

    /// Requests in the current window.
    pub fn current_count(&self) -> u32 {
        self.cleanup_old_timestamps();
        self.timestamps.lock().len() as u32
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.max_requests.saturating_sub(self.current_count())
    }

    /// Wait until a request may be sent, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                self.cleanup_old_timestamps();
                let timestamps = self.timestamps.lock();
                if self.max_requests == 0 || timestamps.len() < self.max_requests as usize {
                    None
                } else {
                    // Room opens when the oldest request leaves the window
                    timestamps
                        .front()
                        .map(|&oldest| (oldest + self.window).saturating_duration_since(Instant::now()))
                }
            };
            match wait {
                None => break,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(1))).await,
            }
        }
        self.record_send();
    }

    fn cleanup_old_timestamps(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while timestamps
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            timestamps.pop_front();
        }
    }
}
