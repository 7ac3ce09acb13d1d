//! Pooled connection references
//!
//! One [`ConnectionRef`] exists per connection the pool asked the transport
//! to create. Hot-path counters are atomics so concurrent picks and
//! completions never contend on the table lock; the detection triple lives
//! behind a per-connection mutex because it is read and written together.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::Instant;

use super::transport::ConnectivityState;
use crate::lb::detector::{DetectionConfig, DetectionState, ResponseTracker};

/// Book-keeping for a single pooled connection
#[derive(Debug)]
pub struct ConnectionRef<H> {
    /// Transport-owned identity
    handle: H,

    /// Readiness as last reported by the transport
    state: AtomicU8,

    /// Calls picked onto this connection that have not completed yet
    active_calls: AtomicU32,

    /// Unresponsiveness tracking
    tracker: Mutex<ResponseTracker>,

    /// Successor requested for this connection, if any
    replaced_by: Mutex<Option<H>>,

    /// Stale connection this one was created to replace
    replaces: Option<H>,

    /// Set once the connection has been dropped from the table
    retired: AtomicBool,

    created_at: Instant,
}

impl<H: Clone + PartialEq> ConnectionRef<H> {
    pub fn new(handle: H, replaces: Option<H>, now: Instant, threshold_ms: u64) -> Self {
        Self {
            handle,
            state: AtomicU8::new(ConnectivityState::Idle as u8),
            active_calls: AtomicU32::new(0),
            tracker: Mutex::new(ResponseTracker::new(now, threshold_ms)),
            replaced_by: Mutex::new(None),
            replaces,
            retired: AtomicBool::new(false),
            created_at: now,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store a new readiness state, returning the previous one
    pub fn set_state(&self, state: ConnectivityState) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectivityState::Ready
    }

    pub fn active_calls(&self) -> u32 {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Increment the in-flight call counter
    pub fn increment_calls(&self) -> u32 {
        self.active_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the in-flight call counter (never below zero)
    pub fn decrement_calls(&self) {
        let _ = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn replaced_by(&self) -> Option<H> {
        self.replaced_by.lock().clone()
    }

    /// Record the successor. Returns `false` if one was already set.
    pub fn set_replaced_by(&self, successor: H) -> bool {
        let mut slot = self.replaced_by.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(successor);
        true
    }

    /// Forget the successor if it is `successor`, so a new replacement can be requested
    pub fn clear_replaced_by(&self, successor: &H) {
        let mut slot = self.replaced_by.lock();
        if slot.as_ref() == Some(successor) {
            *slot = None;
        }
    }

    pub fn replaces(&self) -> Option<&H> {
        self.replaces.as_ref()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn record_success(&self, now: Instant, base_ms: u64) {
        self.tracker.lock().record_success(now, base_ms);
    }

    /// Returns `true` when the connection should be replaced
    pub fn record_deadline_exceeded(&self, now: Instant, config: &DetectionConfig) -> bool {
        self.tracker.lock().record_deadline_exceeded(now, config)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.tracker.lock().consecutive_failures()
    }

    pub fn threshold_ms(&self) -> u64 {
        self.tracker.lock().threshold_ms()
    }

    pub fn last_response(&self) -> Instant {
        self.tracker.lock().last_response()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn detection_state(&self) -> DetectionState {
        DetectionState::classify(
            self.consecutive_failures(),
            self.replaced_by.lock().is_some(),
            self.is_retired(),
        )
    }
}
