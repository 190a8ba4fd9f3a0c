//! SATA Device Plugin
//!
//! A kubelet device plugin that exposes whole, unpartitioned SATA disks of
//! the host as the extended resource `kairen.github.io/sata`, and keeps
//! itself registered across kubelet restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Restart Supervisor                          │
//! │    inotify (plugin dir) + SIGHUP/SIGINT/SIGTERM/SIGQUIT ─▶ restart    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   ┌──────────────────────┐   ┌──────────────┐  │
//! │  │ Device Discovery │──▶│   Plugin Instance    │──▶│ Registration │  │
//! │  │   (lsblk JSON)   │   │ (gRPC on sata.sock)  │   │(kubelet.sock)│  │
//! │  └──────────────────┘   └──────────┬───────────┘   └──────────────┘  │
//! │                                    │                                 │
//! │                 ListAndWatch · Allocate · Options · PreStart         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Device model and the discovery port
//! - [`hardware`]: Host block device discovery
//! - [`plugin`]: Device plugin service, instance lifecycle and registration
//! - [`supervisor`]: Restart loop and its event sources
//! - [`metrics`]: Prometheus metrics
//! - [`proto`]: Generated device plugin API
//! - [`error`]: Error types and handling

pub mod domain;
pub mod error;
pub mod hardware;
pub mod metrics;
pub mod plugin;
pub mod proto;
pub mod supervisor;

// Re-export commonly used types
pub use domain::ports::{DeviceDiscoverer, Device, DiscoveredDevice, Health};

pub use error::{DiscoveryError, Error, ErrorAction, Result};

pub use hardware::{DeviceFilter, DiscoveryConfig, LsblkDiscovery};

pub use metrics::PluginMetrics;

pub use plugin::{
    DevicePluginService, HealthReporter, PluginConfig, PluginInstance, PluginState,
    RegistrationRetry,
};

pub use supervisor::{
    ChannelEvents, EventSource, HostEvents, LoopControl, ShutdownSignal, Supervisor,
    SupervisorEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
