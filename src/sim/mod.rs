//! In-memory transport and simulation driver
//!
//! [`SimulatedTransport`] stands in for a real connection layer: it records
//! every request and can forward them to a driver task that plays the
//! network. [`run_simulation`] uses it to exercise a [`Balancer`] under
//! concurrent load from the command line.
//!
//! [`Balancer`]: crate::core::Balancer

mod driver;
mod transport;

pub use driver::{run_simulation, SimulationOptions, SimulationReport};
pub use transport::{SimHandle, SimulatedTransport, TransportEvent};
