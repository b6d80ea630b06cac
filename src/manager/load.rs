//! Advisory load tracking over a sliding window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counts events within a sliding window and reports when the rate exceeds
/// the configured threshold.
///
/// The signal is advisory: it is used to defer optional work (snapshots,
/// compaction), never to reject it.
pub struct LoadMonitor {
    window: Duration,
    threshold: usize,
    events: Mutex<VecDeque<Instant>>,
}

impl LoadMonitor {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_event(&self) {
        self.record_event_at(Instant::now());
    }

    pub fn record_event_at(&self, now: Instant) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut events, now, self.window);
        events.push_back(now);
    }

    pub fn is_under_high_load(&self) -> bool {
        self.is_under_high_load_at(Instant::now())
    }

    pub fn is_under_high_load_at(&self, now: Instant) -> bool {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut events, now, self.window);
        events.len() > self.threshold
    }

    fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        let cutoff = now.checked_sub(window);
        let Some(cutoff) = cutoff else {
            return;
        };
        while let Some(front) = events.front() {
            if *front >= cutoff {
                break;
            }
            events.pop_front();
        }
    }
}
