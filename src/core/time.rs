//! Timestamps and tick timing

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Tracks how long quadtree ticks take
///
/// Keeps a rolling window of recent tick durations so slow ticks can be
/// reported against the recent average.
pub struct TickTimer {
    started: Option<Instant>,
    last: Duration,
    tick_count: u64,
    history: VecDeque<Duration>,
    window: usize,
}

impl TickTimer {
    /// Create a timer averaging over the last `window` ticks
    pub fn new(window: usize) -> Self {
        Self {
            started: None,
            last: Duration::ZERO,
            tick_count: 0,
            history: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
        }
    }

    /// Mark the start of a tick
    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Mark the end of a tick and return its duration
    pub fn end(&mut self) -> Duration {
        let elapsed = self.started.take().map(|s| s.elapsed()).unwrap_or_default();
        self.record(elapsed);
        elapsed
    }

    fn record(&mut self, elapsed: Duration) {
        self.last = elapsed;
        self.tick_count += 1;
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(elapsed);
    }

    /// Duration of the most recent tick
    pub fn last(&self) -> Duration {
        self.last
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Mean duration over the rolling window
    pub fn average(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        self.history.iter().sum::<Duration>() / self.history.len() as u32
    }

    /// Longest tick in the rolling window
    pub fn max(&self) -> Duration {
        self.history.iter().copied().max().unwrap_or_default()
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new(120)
    }
}
