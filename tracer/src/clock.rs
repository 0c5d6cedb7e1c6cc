use std::time::Instant;

/// Monotonic nanosecond clock anchored at session start.
///
/// Copies share the same epoch, so every thread of a session reads values on
/// the same scale. Values are only ordered within a thread's own stream.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        // u64 nanoseconds cover ~584 years
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
