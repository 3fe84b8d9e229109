//! Library modules for the sentinel monitoring loop.
//!
//! The binary in `main.rs` is a thin cycle driver over these: it builds the
//! node fleet, then runs health checks and rule evaluation on an interval.

pub mod abi;
pub mod config;
pub mod health;
pub mod node;
pub mod reader;
pub mod rules;
pub mod signals;
pub mod tx;
