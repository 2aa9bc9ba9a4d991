use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic timestamp of the last ping received from a client
#[derive(Debug)]
pub struct LivenessTracker {
    last_ping: Mutex<Instant>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            last_ping: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last_ping.lock().elapsed()
    }

    /// Whole seconds since the last ping, truncated
    pub fn seconds_since(&self) -> u64 {
        self.elapsed().as_secs()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last_ping = self.last_ping.lock();
        if let Some(earlier) = last_ping.checked_sub(by) {
            *last_ping = earlier;
        }
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}
