//! Domain Ports - Core types and trait definitions for the device plugin
//!
//! These types define the boundary between the plugin lifecycle and the
//! host. Adapters implement [`DeviceDiscoverer`] to enumerate block devices.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Device Health
// =============================================================================

/// Per-device health advertised through ListAndWatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation used by the kubelet device plugin API
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Devices
// =============================================================================

/// A device exposed to the kubelet
///
/// The id is positional: it is the device's rank in the discovery pass run
/// when the plugin instance was built, and is reassigned on every rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Positional id ("0", "1", ...)
    pub id: String,
    /// Current health
    pub health: Health,
}

impl Device {
    /// Create a healthy device with the given positional index
    pub fn healthy(index: usize) -> Self {
        Self {
            id: index.to_string(),
            health: Health::Healthy,
        }
    }

    /// Check if the device is healthy
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// A block device found on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Kernel name (e.g., sdb)
    pub name: String,
    /// Device node path (e.g., /dev/sdb)
    pub path: String,
    /// Human readable size as reported by the host (e.g., 931.5G)
    pub size: String,
    /// Whether the device carries partitions or other child devices
    pub has_children: bool,
}

// =============================================================================
// Discovery Port
// =============================================================================

/// Enumerates eligible block devices on the local host
///
/// Every call re-reads host state; implementations must not cache. The
/// returned order is the positional identity basis for device ids and for
/// Allocate.
#[async_trait]
pub trait DeviceDiscoverer: Send + Sync {
    /// Discover eligible devices in host enumeration order
    async fn discover(&self) -> std::result::Result<Vec<DiscoveredDevice>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_wire_strings() {
        assert_eq!(Health::Healthy.as_str(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }

    #[test]
    fn test_positional_device() {
        let device = Device::healthy(3);
        assert_eq!(device.id, "3");
        assert!(device.is_healthy());
    }
}
