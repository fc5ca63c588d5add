use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// An interval-based limiter for noisy diagnostics.
///
/// [`RateLimit::allow`] returns `true` at most once per interval, so a warning
/// sitting on a hot path fires once and then goes quiet until the interval
/// elapses. Const-constructible so it can back a `static`.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimit {
    /// Creates a limiter that allows one event per `interval`.
    pub const fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// Returns `true` if an event is allowed now, consuming the slot.
    pub fn allow(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
