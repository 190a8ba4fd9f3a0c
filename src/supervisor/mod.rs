//! Supervisor Module
//!
//! Keeps exactly one plugin instance registered with the kubelet across
//! kubelet restarts, socket churn and signals.

pub mod control;
pub mod events;

pub use control::*;
pub use events::*;
