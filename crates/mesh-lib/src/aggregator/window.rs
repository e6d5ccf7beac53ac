//! Bounded per-(node, channel) sample buffer

use crate::models::Telemetry;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Time-ordered buffer of recent telemetry samples for one (node, channel).
///
/// Samples age out of the head on each aggregation tick; the capacity bound
/// protects against a node flooding one channel between ticks.
#[derive(Debug)]
pub struct SampleWindow {
    samples: VecDeque<Telemetry>,
    max_samples: usize,
}

impl SampleWindow {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples,
        }
    }

    /// Append a sample, evicting the oldest while over capacity.
    pub fn push(&mut self, sample: Telemetry) {
        self.samples.push_back(sample);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Drop aged-out samples from the head.
    ///
    /// Pruning stops at the first sample whose timestamp does not parse:
    /// unparseable timestamps are left in place rather than silently removed.
    pub fn prune_before(&mut self, window_start: DateTime<Utc>) {
        while let Some(head) = self.samples.front() {
            match head.parsed_timestamp() {
                Some(ts) if ts < window_start => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Consistent copy of the current window contents.
    pub fn snapshot(&self) -> Vec<Telemetry> {
        self.samples.iter().cloned().collect()
    }

    /// True when the newest sample falls inside the window.
    pub fn has_recent_real(&self, window_start: DateTime<Utc>) -> bool {
        self.samples
            .back()
            .and_then(|t| t.parsed_timestamp())
            .map(|ts| ts >= window_start)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
