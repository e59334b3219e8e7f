//! Sliding window of outstanding-request samples.
//!
//! The automatically scaled pool records the outstanding count at the
//! start of every counted request and sizes itself from the peak seen in
//! the last window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// How far back samples participate in required-instance calculations.
pub(crate) const HISTORY_WINDOW: Duration = Duration::from_secs(60);

/// Timestamped outstanding-request samples, oldest first.
#[derive(Debug, Default)]
pub struct RequestHistory {
    samples: VecDeque<(Instant, usize)>,
}

impl RequestHistory {
    pub fn new() -> Self {
        RequestHistory {
            samples: VecDeque::new(),
        }
    }

    /// Record the outstanding count observed at `now`.
    pub fn record(&mut self, now: Instant, outstanding: usize) {
        self.samples.push_back((now, outstanding));
    }

    /// Drop samples that have aged out of the window.
    pub fn trim(&mut self, now: Instant) {
        // Early in the process lifetime `now` may be younger than the
        // window itself; nothing can have aged out yet.
        let Some(window_start) = now.checked_sub(HISTORY_WINDOW) else {
            return;
        };
        while let Some(&(t, _)) = self.samples.front() {
            if t < window_start {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Largest sample remaining in the window, 0 when empty.
    pub fn peak(&mut self, now: Instant) -> usize {
        self.trim(now);
        self.samples.iter().map(|&(_, n)| n).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
