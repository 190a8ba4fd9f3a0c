//! lsblk Discovery
//!
//! Enumerates block devices by running a host command that prints an
//! lsblk-style JSON document, then filters it down to whole disks.

use super::filter::DeviceFilter;
use crate::domain::ports::{DeviceDiscoverer, DiscoveredDevice};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_COMMAND: &str = "lsblk -n -o name,size -J";
const DEFAULT_KEY: &str = "blockdevices";
const DEFAULT_DEV_DIR: &str = "/dev/";

// =============================================================================
// Discovery Configuration
// =============================================================================

/// Configuration for host device discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Shell used to run the enumeration command
    pub shell: String,
    /// Enumeration command, run as `<shell> -c <command>`
    pub command: String,
    /// Top-level key holding the device array
    pub key: String,
    /// Directory holding device nodes
    pub dev_dir: String,
    /// Eligibility filter
    pub filter: DeviceFilter,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            command: DEFAULT_COMMAND.to_string(),
            key: DEFAULT_KEY.to_string(),
            dev_dir: DEFAULT_DEV_DIR.to_string(),
            filter: DeviceFilter::default(),
        }
    }
}

// =============================================================================
// JSON Records
// =============================================================================

#[derive(Debug, Deserialize)]
struct BlockDeviceRecord {
    name: String,
    #[serde(default)]
    size: Option<serde_json::Value>,
    #[serde(default)]
    children: Option<Vec<serde_json::Value>>,
}

impl BlockDeviceRecord {
    fn into_device(self, dev_dir: &str) -> DiscoveredDevice {
        // lsblk prints a label ("931.5G") by default and a number with -b
        let size = match self.size {
            Some(serde_json::Value::String(label)) => label,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };

        DiscoveredDevice {
            path: Path::new(dev_dir).join(&self.name).to_string_lossy().into_owned(),
            name: self.name,
            size,
            has_children: self.children.is_some_and(|c| !c.is_empty()),
        }
    }
}

/// Parse every record of an lsblk JSON document, unfiltered
pub fn parse_block_devices(
    data: &str,
    key: &str,
    dev_dir: &str,
) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let document: serde_json::Value = serde_json::from_str(data)?;

    let records = match document {
        serde_json::Value::Object(mut map) => map.remove(key),
        _ => None,
    }
    .ok_or_else(|| DiscoveryError::MissingKey {
        key: key.to_string(),
    })?;

    let records: Vec<BlockDeviceRecord> = serde_json::from_value(records)?;

    Ok(records
        .into_iter()
        .map(|record| record.into_device(dev_dir))
        .collect())
}

// =============================================================================
// lsblk Discovery
// =============================================================================

/// Discovers whole SATA disks through a host enumeration command
pub struct LsblkDiscovery {
    config: DiscoveryConfig,
}

impl LsblkDiscovery {
    /// Create a new discovery adapter
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the discovery configuration
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Parse and filter already captured command output
    pub fn discover_from_output(
        &self,
        data: &str,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let all = parse_block_devices(data, &self.config.key, &self.config.dev_dir)?;
        let eligible = self.config.filter.retain(all);
        debug!(
            devices = ?eligible.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "Discovered eligible devices"
        );
        Ok(eligible)
    }

    /// Run the enumeration command and return its stdout
    async fn run_command(&self) -> Result<String, DiscoveryError> {
        debug!(command = %self.config.command, "Running discovery command");

        let output = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&self.config.command)
            .output()
            .await
            .map_err(|source| DiscoveryError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(DiscoveryError::CommandFailed {
                command: self.config.command.clone(),
                status: output.status.to_string(),
                output: combined.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for LsblkDiscovery {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

#[async_trait]
impl DeviceDiscoverer for LsblkDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let data = self.run_command().await?;
        self.discover_from_output(&data)
    }
}
