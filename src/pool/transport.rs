//! Capability interface over the transport layer
//!
//! The pool never opens sockets itself. It asks a [`Transport`] to create,
//! connect, re-address and remove connections, and learns about their
//! progress through state notifications delivered by the caller.

use std::fmt::Debug;
use std::hash::Hash;

/// Readiness of a single pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }

    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }
}

/// Backend address as handed over by name resolution
pub type Address = String;

/// Requests the pool issues to the transport layer.
///
/// All methods are fire-and-forget: they must not block on I/O and must not
/// call back into the balancer synchronously. Connection failures are
/// reported later as a `TransientFailure` state notification.
pub trait Transport: Send + Sync + 'static {
    /// Opaque connection identity, owned by the transport
    type Handle: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Create a new connection to the given address set
    fn create_connection(&self, addresses: &[Address]) -> Self::Handle;

    /// Ask a connection to start (or restart) connecting
    fn connect(&self, handle: &Self::Handle);

    /// Replace the address set of a live connection
    fn update_addresses(&self, handle: &Self::Handle, addresses: &[Address]);

    /// Tear a connection down
    fn remove_connection(&self, handle: &Self::Handle);
}
