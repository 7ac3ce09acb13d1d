//! CLI module for chanpool
//!
//! Command implementations behind the `chanpool` binary. The binary parses
//! arguments and sets up logging, then hands off to [`commands`].
//!
//! # Usage
//!
//! ```bash
//! # Print the resolved configuration
//! chanpool validate pool.yaml
//!
//! # Drive a balancer over a simulated network
//! chanpool simulate --config pool.yaml --calls 5000 --concurrency 32 --deadline-rate 0.05
//! ```

pub mod commands;
