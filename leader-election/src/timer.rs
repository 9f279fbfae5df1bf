//! Per-node timers.
//!
//! Timers are plain deadlines owned by the protocol state. The worker sleeps
//! until the earliest one and feeds the expiry back into the same event loop
//! that handles messages, so a reset can never race with a delivery.

use std::ops::Range;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::types::NodeId;

/// Randomized election timeout, re-rolled on every reset.
#[derive(Debug)]
pub struct ElectionTimer {
    range: Range<Duration>,
    deadline: Instant,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(range: Range<Duration>, seed: Option<u64>, id: NodeId, now: Instant) -> Self {
        let rng = match seed {
            // Mix in the id so seeded nodes still time out at different moments.
            Some(seed) => StdRng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        let mut timer = Self {
            range,
            deadline: now,
            rng,
        };
        timer.reset(now);
        timer
    }

    pub fn reset(&mut self, now: Instant) {
        let timeout = self.sample();
        self.deadline = now + timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn sample(&mut self) -> Duration {
        let low = self.range.start.as_micros() as u64;
        let high = self.range.end.as_micros() as u64;
        if high <= low {
            return self.range.start;
        }
        Duration::from_micros(self.rng.gen_range(low..high))
    }
}

/// Fixed-interval timer that can be switched off (heartbeats, collection windows).
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Arms the ticker to fire one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}
