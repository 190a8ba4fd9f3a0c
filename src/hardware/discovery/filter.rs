//! Whole-disk name filter
//!
//! Decides which enumerated block devices are eligible for exposure.

use crate::domain::ports::DiscoveredDevice;

/// Accepts unpartitioned devices named `<prefix><letters>`
///
/// With the default prefix `sd` and a suffix of at most two letters this
/// matches `sda`, `sdb` or `sdaa` but never `sda1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Fixed kernel name prefix
    pub name_prefix: String,
    /// Maximum number of lowercase letters after the prefix
    pub max_suffix_len: usize,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_prefix: "sd".to_string(),
            max_suffix_len: 2,
        }
    }
}

impl DeviceFilter {
    /// Create a filter for the given prefix with the default suffix length
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Check whether a kernel name denotes a whole disk
    pub fn matches_name(&self, name: &str) -> bool {
        let Some(suffix) = name.strip_prefix(self.name_prefix.as_str()) else {
            return false;
        };

        !suffix.is_empty()
            && suffix.len() <= self.max_suffix_len
            && suffix.bytes().all(|b| b.is_ascii_lowercase())
    }

    /// Check whether a device may be exposed
    pub fn is_eligible(&self, device: &DiscoveredDevice) -> bool {
        !device.has_children && self.matches_name(&device.name)
    }

    /// Drop ineligible devices, keeping the original order
    pub fn retain(&self, devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
        devices
            .into_iter()
            .filter(|device| self.is_eligible(device))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, has_children: bool) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            size: "1T".to_string(),
            has_children,
        }
    }

    #[test]
    fn test_matches_whole_disk_names() {
        let filter = DeviceFilter::default();

        assert!(filter.matches_name("sda"));
        assert!(filter.matches_name("sdz"));
        assert!(filter.matches_name("sdab"));
        assert!(!filter.matches_name("sda1"));
        assert!(!filter.matches_name("sdabc"));
        assert!(!filter.matches_name("sd"));
        assert!(!filter.matches_name("sdA"));
        assert!(!filter.matches_name("nvme0n1"));
        assert!(!filter.matches_name("xsda"));
    }

    #[test]
    fn test_partitioned_disk_is_ineligible() {
        let filter = DeviceFilter::default();

        assert!(filter.is_eligible(&device("sdb", false)));
        assert!(!filter.is_eligible(&device("sda", true)));
    }

    #[test]
    fn test_retain_keeps_order() {
        let filter = DeviceFilter::default();
        let devices = vec![
            device("sdc", false),
            device("sda", true),
            device("loop0", false),
            device("sdb", false),
        ];

        let names: Vec<_> = filter
            .retain(devices)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["sdc", "sdb"]);
    }

    #[test]
    fn test_custom_prefix() {
        let filter = DeviceFilter::with_prefix("vd");
        assert!(filter.matches_name("vda"));
        assert!(!filter.matches_name("sda"));
    }
}
