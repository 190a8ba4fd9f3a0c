//! Domain layer - Core types and port definitions
//!
//! This module defines the device model and the discovery port that host
//! adapters implement.

pub mod ports;

pub use ports::*;
