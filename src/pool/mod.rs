//! Connection pool module
//!
//! This module provides:
//! - The transport capability trait the pool drives
//! - Per-connection reference records with lock-free call counters
//! - The pool manager that owns the reference and affinity tables
//! - Replacement of unresponsive connections once their successor is READY

pub mod clock;
pub mod connection;
pub mod manager;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::ConnectionRef;
pub use manager::{ConnectionStats, PoolManager, PoolSettings, PoolStats};
pub use transport::{Address, ConnectivityState, Transport};
