//! Load balancing module for chanpool
//!
//! This module decides which pooled connection each call uses and whether a
//! connection should be discarded.
//!
//! # Components
//!
//! - [`Picker`]: Per-call selection and completion accounting
//! - [`AffinityRouter`]: Sticky routing of calls sharing an affinity key
//! - [`ResponseTracker`]: Time and count based unresponsive detection
//!
//! # Selection
//!
//! 1. A call whose affinity key is bound to a READY connection goes there.
//! 2. Otherwise the READY connection with the fewest in-flight calls is used,
//!    ties going to the connection that joined the pool first.
//! 3. With no READY connection the pick fails fast with `Unavailable`.
//!
//! # Example Usage
//!
//! ```rust
//! use chanpool::config::ApiConfig;
//! use chanpool::lb::{DoneInfo, PickInfo, Picker};
//! use chanpool::pool::{ConnectivityState, PoolManager};
//! use chanpool::sim::SimulatedTransport;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(SimulatedTransport::new());
//! let pool = Arc::new(PoolManager::new(Arc::clone(&transport)));
//! pool.on_config_update(vec!["backend:443".to_string()], ApiConfig::defaults());
//!
//! for handle in transport.created() {
//!     pool.on_connection_state_change(&handle, ConnectivityState::Ready);
//! }
//!
//! let picker = Picker::new(Arc::clone(&pool));
//! let result = picker.pick(PickInfo::new("svc/Get")).unwrap();
//!
//! // ... perform the call on result.connection ...
//!
//! (result.done)(DoneInfo::ok());
//! ```
//!
//! # Thread Safety
//!
//! Picks and completions only touch per-connection atomics and short-lived
//! read locks, so unrelated calls never serialize on each other.

pub mod affinity;
pub mod detector;
pub mod picker;

pub use affinity::{extract_key, AffinityRouter, AffinityTable, KeyExtractionError, Route};
pub use detector::{DetectionConfig, DetectionState, ResponseTracker};
pub use picker::{
    CallOutcome, DoneCallback, DoneInfo, PickError, PickInfo, PickResult, Picker,
    UnavailableReason,
};
