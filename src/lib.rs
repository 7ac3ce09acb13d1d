//! chanpool - client-side connection pool balancer with affinity routing
//! and unresponsive connection replacement

pub mod cli;
pub mod config;
pub mod core;
pub mod lb;
pub mod pool;
pub mod sim;

pub use config::ApiConfig;
pub use crate::core::{Balancer, ClientConnState};
