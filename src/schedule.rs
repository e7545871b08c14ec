//! Timers driven from the UI loop. Each is polled with the current instant
//! on every frame, so they all run on the UI thread and never overlap.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Periodic {
    interval: Duration,
    last: Option<Instant>,
}

impl Periodic {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True on the first poll and then at most once per interval.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.last.map_or(Duration::ZERO, |last| {
            self.interval.saturating_sub(now.saturating_duration_since(last))
        })
    }
}

/// Fires once, the first time it is polled at or after its deadline.
#[derive(Debug)]
pub struct Deferred {
    deadline: Instant,
    fired: bool,
}

impl Deferred {
    pub fn new(start: Instant, delay: Duration) -> Self {
        Self {
            deadline: start + delay,
            fired: false,
        }
    }

    pub fn fire(&mut self, now: Instant) -> bool {
        if self.fired || now < self.deadline {
            return false;
        }
        self.fired = true;
        true
    }

    /// `None` once fired.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        (!self.fired).then(|| self.deadline.saturating_duration_since(now))
    }
}
