//! Unresponsive-connection detection
//!
//! A connection is considered unresponsive when two conditions hold at the
//! same time on a deadline-exceeded completion:
//!
//! - at least `unresponsive_calls` consecutive calls ended with deadline exceeded
//! - at least the current threshold has passed since the last response
//!
//! The threshold starts at `unresponsive_detection_ms`, doubles across each
//! replacement without an intervening success, and snaps back to the base
//! value on any success. Checks run synchronously at completion time.

use std::time::Instant;

use crate::config::ChannelPoolConfig;

/// Snapshot of the detection settings captured by each completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionConfig {
    /// Base threshold in milliseconds (0 = detection disabled)
    pub detection_ms: u64,

    /// Consecutive deadline-exceeded completions required
    pub calls: u32,
}

impl DetectionConfig {
    pub fn from_pool(pool: &ChannelPoolConfig) -> Self {
        Self {
            detection_ms: u64::from(pool.unresponsive_detection_ms),
            calls: pool.unresponsive_calls,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.detection_ms > 0
    }
}

/// Where a connection sits in the detection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DetectionState {
    /// No consecutive failures
    Responsive,
    /// Some consecutive failures, replacement not yet warranted
    Degraded,
    /// Replacement requested, waiting for it to become READY
    Replacing,
    /// Removed from the pool after its replacement became READY
    Retired,
}

impl DetectionState {
    pub fn classify(consecutive_failures: u32, replacing: bool, retired: bool) -> Self {
        if retired {
            DetectionState::Retired
        } else if replacing {
            DetectionState::Replacing
        } else if consecutive_failures > 0 {
            DetectionState::Degraded
        } else {
            DetectionState::Responsive
        }
    }
}

/// Per-connection response bookkeeping
#[derive(Debug, Clone)]
pub struct ResponseTracker {
    last_response: Instant,
    consecutive_failures: u32,
    threshold_ms: u64,
}

impl ResponseTracker {
    /// Start tracking at `now`, as if a response had just arrived
    pub fn new(now: Instant, threshold_ms: u64) -> Self {
        Self {
            last_response: now,
            consecutive_failures: 0,
            threshold_ms,
        }
    }

    /// A response arrived: reset the failure count and the threshold
    pub fn record_success(&mut self, now: Instant, base_ms: u64) {
        self.last_response = now;
        self.consecutive_failures = 0;
        self.threshold_ms = base_ms;
    }

    /// A call ended with deadline exceeded.
    ///
    /// Returns `true` when the connection should be replaced.
    pub fn record_deadline_exceeded(&mut self, now: Instant, config: &DetectionConfig) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if !config.enabled() || self.consecutive_failures < config.calls {
            return false;
        }

        let silent_ms = now.saturating_duration_since(self.last_response).as_millis();
        silent_ms >= u128::from(self.threshold_ms)
    }

    pub fn last_response(&self) -> Instant {
        self.last_response
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }
}
