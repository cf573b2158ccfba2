//! Frame-rate tracking for connection health
//!
//! Keeps a trailing window of frame-arrival timestamps and derives a frames
//! per second estimate from it. The window is intentionally short so the
//! estimate follows the stream instead of its history.

use crate::connection::state::ConnectionHealth;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Trailing window length; frames older than this are discarded.
const WINDOW: Duration = Duration::from_secs(2);

/// Cap on samples kept, so a fast stream does not grow the buffer.
const MAX_SAMPLES: usize = 30;

/// Rolling estimate of the observed frame-arrival rate.
#[derive(Debug)]
pub struct FrameRateTracker {
    samples: VecDeque<Instant>,
    last_frame: Option<Instant>,
}

impl FrameRateTracker {
    pub fn new() -> Self {
        FrameRateTracker {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            last_frame: None,
        }
    }

    /// Record one frame arrival at `now`.
    pub fn record_frame(&mut self, now: Instant) {
        self.last_frame = Some(now);
        self.samples.push_back(now);
        self.prune(now);
    }

    /// Timestamp of the most recent frame, if any arrived yet.
    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }

    /// True when no frame arrived within `timeout` of `now`.
    ///
    /// A tracker that never saw a frame is not stale; staleness is only
    /// measured between frames, the caller handles the never-connected case.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_frame {
            Some(t) => now.duration_since(t) > timeout,
            None => false,
        }
    }

    /// Estimated frames per second over the trailing window.
    pub fn fps(&mut self, now: Instant) -> f64 {
        self.prune(now);

        let last = match self.last_frame {
            Some(t) => t,
            None => return 0.0,
        };

        if self.samples.len() >= 2 {
            let first = *self.samples.front().unwrap();
            let span = last.duration_since(first).as_secs_f64();
            if span > 0.0 {
                return (self.samples.len() - 1) as f64 / span;
            }
        }

        // Not enough history yet: a frame within the last second counts as
        // a healthy stream, anything older decays with its age.
        let since_last = now.duration_since(last).as_secs_f64();
        if since_last < 1.0 {
            30.0
        } else {
            1.0 / since_last
        }
    }

    pub fn classify(&mut self, now: Instant) -> ConnectionHealth {
        ConnectionHealth::from_fps(self.fps(now))
    }

    /// Forget all history, used when a connection is (re)established.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_frame = None;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }
}

impl Default for FrameRateTracker {
    fn default() -> Self {
        Self::new()
    }
}
