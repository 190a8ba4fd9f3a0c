//! Plugin Configuration
//!
//! Paths, names and timeouts used by a plugin instance and its supervisor.

use crate::hardware::discovery::DiscoveryConfig;
use crate::proto::API_VERSION;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Directory where the kubelet expects device plugin sockets
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// File name of the kubelet registration socket
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// File name of this plugin's socket
pub const PLUGIN_SOCKET_NAME: &str = "sata.sock";

/// Resource advertised to the kubelet
pub const RESOURCE_NAME: &str = "kairen.github.io/sata";

// =============================================================================
// Registration Retry
// =============================================================================

/// How the supervisor paces registration retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationRetry {
    /// Retry as soon as the previous attempt failed
    Immediate,
    /// Retry after an exponentially growing delay, capped at `max_interval`
    Backoff {
        initial_interval: Duration,
        max_interval: Duration,
    },
}

impl RegistrationRetry {
    /// Backoff with the default bounds
    pub fn backoff() -> Self {
        RegistrationRetry::Backoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Plugin Configuration
// =============================================================================

/// Configuration shared by the supervisor and every plugin instance
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Directory holding the plugin and kubelet sockets
    pub plugin_dir: PathBuf,
    /// File name of this plugin's socket inside `plugin_dir`
    pub socket_name: String,
    /// File name of the kubelet registration socket inside `plugin_dir`
    pub kubelet_socket_name: String,
    /// Advertised extended resource name
    pub resource_name: String,
    /// Device plugin API version sent at registration
    pub api_version: String,
    /// Bound on the self-dial and the registration dial
    pub dial_timeout: Duration,
    /// Bound on draining the RPC server during Stop
    pub shutdown_timeout: Duration,
    /// Expose at most this many devices
    pub max_devices: Option<usize>,
    /// Registration retry pacing
    pub registration_retry: RegistrationRetry,
    /// Host discovery settings
    pub discovery: DiscoveryConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
            socket_name: PLUGIN_SOCKET_NAME.to_string(),
            kubelet_socket_name: KUBELET_SOCKET_NAME.to_string(),
            resource_name: RESOURCE_NAME.to_string(),
            api_version: API_VERSION.to_string(),
            dial_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_devices: None,
            registration_retry: RegistrationRetry::Immediate,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Configuration rooted at a different plugin directory
    pub fn with_plugin_dir(plugin_dir: impl AsRef<Path>) -> Self {
        Self {
            plugin_dir: plugin_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Full path of this plugin's socket
    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.socket_name)
    }

    /// Full path of the kubelet registration socket
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.kubelet_socket_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PluginConfig::default();

        assert_eq!(
            config.socket_path(),
            PathBuf::from("/var/lib/kubelet/device-plugins/sata.sock")
        );
        assert_eq!(
            config.kubelet_socket_path(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert_eq!(config.resource_name, "kairen.github.io/sata");
        assert_eq!(config.api_version, "v1beta1");
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.registration_retry, RegistrationRetry::Immediate);
        assert!(config.max_devices.is_none());
    }

    #[test]
    fn test_with_plugin_dir() {
        let config = PluginConfig::with_plugin_dir("/tmp/plugins");
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/plugins/sata.sock"));
    }
}
