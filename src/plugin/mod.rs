//! Device Plugin Module
//!
//! The kubelet-facing half of the plugin: configuration, the gRPC service,
//! the socket lifecycle of a plugin instance and kubelet registration.

pub mod config;
pub mod health;
pub mod instance;
pub mod registration;
pub mod service;
pub mod transport;

pub use config::*;
pub use health::{health_channel, DeviceTable, HealthReporter, HealthUpdate, HealthUpdates};
pub use instance::*;
pub use registration::*;
pub use service::*;
pub use transport::dial;
