//! GPIO Reset Monitor (C8): long-press detection on the reset line (§6.3,
//! §8 property 7 — exactly one `ResetRequested` per qualifying hold, zero
//! for a release that never reaches the threshold).

use std::time::{Duration, Instant};

use tracing::info;

use crate::bus::EventBus;
use crate::events::Event;
use crate::transport::ResetLine;

#[derive(Debug, Clone, Copy)]
pub struct ResetMonitorConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub hold_threshold: Duration,
}

impl Default for ResetMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            debounce: Duration::from_millis(50),
            hold_threshold: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    /// First sample where the line read asserted, before debounce confirms it.
    candidate_since: Option<Instant>,
    /// Debounce-confirmed start of the current hold, if any.
    asserted_since: Option<Instant>,
    fired: bool,
}

impl MonitorState {
    /// Feeds one raw sample. Returns `true` exactly once per qualifying
    /// hold, on the sample that first reaches `hold_threshold`.
    fn on_sample(&mut self, asserted: bool, now: Instant, config: &ResetMonitorConfig) -> bool {
        if !asserted {
            self.candidate_since = None;
            self.asserted_since = None;
            self.fired = false;
            return false;
        }

        let candidate_since = *self.candidate_since.get_or_insert(now);
        if self.asserted_since.is_none() {
            if now.saturating_duration_since(candidate_since) < config.debounce {
                return false;
            }
            self.asserted_since = Some(candidate_since);
        }

        let held_for = now.saturating_duration_since(self.asserted_since.expect("set above"));
        if !self.fired && held_for >= config.hold_threshold {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Polls a `ResetLine` and publishes `ResetRequested` on the bus once per
/// qualifying hold.
pub struct ResetMonitor<L> {
    line: L,
    config: ResetMonitorConfig,
}

impl<L: ResetLine> ResetMonitor<L> {
    pub fn new(line: L, config: ResetMonitorConfig) -> Self {
        Self { line, config }
    }

    /// Runs until the caller's task is cancelled. Never returns on its own.
    pub async fn run(&self, bus: &EventBus) {
        let mut state = MonitorState::default();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if state.on_sample(self.line.is_asserted(), Instant::now(), &self.config) {
                info!("reset line held past threshold, requesting factory reset");
                bus.publish(Event::ResetRequested);
            }
        }
    }
}
