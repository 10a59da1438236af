//! Per-category elapsed time for a call
//!
//! A call's quality metrics depend on how long it spent in each sub-state,
//! not only on its total wall time. [`DurationTracker`] keeps an accumulated
//! total per named category plus the start instant of every open category.
//!
//! ```rust
//! use call_session_core::DurationTracker;
//!
//! let mut tracker = DurationTracker::new();
//! tracker.start("connected");
//! tracker.stop("connected");
//! // stop without a matching start is a no-op
//! tracker.stop("hold");
//! assert_eq!(tracker.get("hold"), std::time::Duration::ZERO);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Category names used by call handles
pub mod category {
    pub const RINGING: &str = "ringing";
    pub const CONNECTED: &str = "connected";
    pub const HOLD: &str = "hold";
    pub const MUTED: &str = "muted";
}

#[derive(Debug, Clone, Default)]
pub struct DurationTracker {
    accumulated: HashMap<String, Duration>,
    started: HashMap<String, Instant>,
}

impl DurationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `category`. Starting an already open category keeps the original
    /// start instant.
    pub fn start(&mut self, category: &str) {
        self.started
            .entry(category.to_string())
            .or_insert_with(Instant::now);
    }

    /// Close `category` and add the elapsed time to its total
    ///
    /// Returns the time added, or `None` when there was no unmatched start.
    pub fn stop(&mut self, category: &str) -> Option<Duration> {
        let started = self.started.remove(category)?;
        let elapsed = started.elapsed();
        *self
            .accumulated
            .entry(category.to_string())
            .or_insert(Duration::ZERO) += elapsed;
        Some(elapsed)
    }

    /// Close every open category
    pub fn stop_all(&mut self) {
        let open: Vec<String> = self.started.keys().cloned().collect();
        for category in open {
            self.stop(&category);
        }
    }

    /// Accumulated time for `category` over closed intervals only
    pub fn get(&self, category: &str) -> Duration {
        self.accumulated.get(category).copied().unwrap_or_default()
    }

    /// Accumulated time plus the running interval, if the category is open
    pub fn current(&self, category: &str) -> Duration {
        let running = self
            .started
            .get(category)
            .map(Instant::elapsed)
            .unwrap_or_default();
        self.get(category) + running
    }

    pub fn is_running(&self, category: &str) -> bool {
        self.started.contains_key(category)
    }

    /// Snapshot of every category seen so far, open intervals included
    pub fn snapshot(&self) -> HashMap<String, Duration> {
        let mut out = self.accumulated.clone();
        for (category, started) in &self.started {
            *out.entry(category.clone()).or_insert(Duration::ZERO) += started.elapsed();
        }
        out
    }
}
