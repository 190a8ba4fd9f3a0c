//! Hardware Module
//!
//! Provides host block device discovery for the device plugin.

pub mod discovery;

pub use discovery::*;
