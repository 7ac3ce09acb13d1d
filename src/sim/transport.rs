use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::pool::{Address, Transport};

/// Connection identity handed out by [`SimulatedTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SimHandle(pub u64);

impl fmt::Display for SimHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Request received by the simulated transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Created(SimHandle),
    Connected(SimHandle),
    AddressesUpdated(SimHandle),
    Removed(SimHandle),
}

/// In-memory transport that records every request it receives.
///
/// Optionally forwards each request over a channel so a driver task can
/// play the part of the network and report state changes back.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    next_id: AtomicU64,
    events: Mutex<Vec<TransportEvent>>,
    notifier: Option<UnboundedSender<TransportEvent>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every request to `notifier` as well as recording it
    pub fn with_notifier(notifier: UnboundedSender<TransportEvent>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::default()
        }
    }

    /// Every request received so far, in order
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Handles of all created connections, in creation order
    pub fn created(&self) -> Vec<SimHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Created(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    /// Handles of all removed connections, in removal order
    pub fn removed(&self) -> Vec<SimHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Removed(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self, handle: &SimHandle) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Connected(h) if h == handle))
            .count()
    }

    pub fn address_updates(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransportEvent::AddressesUpdated(_)))
            .count()
    }

    fn record(&self, event: TransportEvent) {
        trace!(event = ?event, "Transport request");
        if let Some(notifier) = &self.notifier {
            // Receiver gone means the driver stopped; recording is still useful.
            let _ = notifier.send(event.clone());
        }
        self.events.lock().push(event);
    }
}

impl Transport for SimulatedTransport {
    type Handle = SimHandle;

    fn create_connection(&self, _addresses: &[Address]) -> SimHandle {
        let handle = SimHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.record(TransportEvent::Created(handle));
        handle
    }

    fn connect(&self, handle: &SimHandle) {
        self.record(TransportEvent::Connected(*handle));
    }

    fn update_addresses(&self, handle: &SimHandle, _addresses: &[Address]) {
        self.record(TransportEvent::AddressesUpdated(*handle));
    }

    fn remove_connection(&self, handle: &SimHandle) {
        self.record(TransportEvent::Removed(*handle));
    }
}
