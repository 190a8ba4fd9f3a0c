//! Plugin Metrics
//!
//! Prometheus metrics for the device plugin, kept in a dedicated registry
//! so several plugin instances (or tests) never collide on registration.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics recorded by the supervisor and the RPC service
#[derive(Clone)]
pub struct PluginMetrics {
    registry: Registry,
    /// Plugin rebuilds performed by the supervisor
    pub restarts_total: IntCounter,
    /// Registration attempts by result
    pub registrations_total: IntCounterVec,
    /// Allocate calls by result
    pub allocations_total: IntCounterVec,
    /// Devices exposed by the current instance
    pub devices: IntGauge,
    /// Devices marked unhealthy in the current instance
    pub unhealthy_devices: IntGauge,
    /// Open ListAndWatch streams
    pub watch_streams: IntGauge,
    /// 1 while the current instance is registered with the kubelet
    pub registered: IntGauge,
}

impl PluginMetrics {
    /// Create and register all plugin metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let restarts_total = IntCounter::new(
            "sata_plugin_restarts_total",
            "Number of device plugin rebuilds",
        )?;
        let registrations_total = IntCounterVec::new(
            Opts::new(
                "sata_plugin_registrations_total",
                "Registration attempts with the kubelet",
            ),
            &["result"],
        )?;
        let allocations_total = IntCounterVec::new(
            Opts::new("sata_plugin_allocations_total", "Allocate calls served"),
            &["result"],
        )?;
        let devices = IntGauge::new("sata_plugin_devices", "Devices exposed to the kubelet")?;
        let unhealthy_devices = IntGauge::new(
            "sata_plugin_unhealthy_devices",
            "Devices currently marked unhealthy",
        )?;
        let watch_streams = IntGauge::new(
            "sata_plugin_watch_streams",
            "Open ListAndWatch streams",
        )?;
        let registered = IntGauge::new(
            "sata_plugin_registered",
            "Whether the plugin is registered with the kubelet",
        )?;

        registry.register(Box::new(restarts_total.clone()))?;
        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(allocations_total.clone()))?;
        registry.register(Box::new(devices.clone()))?;
        registry.register(Box::new(unhealthy_devices.clone()))?;
        registry.register(Box::new(watch_streams.clone()))?;
        registry.register(Box::new(registered.clone()))?;

        Ok(Self {
            registry,
            restarts_total,
            registrations_total,
            allocations_total,
            devices,
            unhealthy_devices,
            watch_streams,
            registered,
        })
    }

    /// Check if the plugin is currently registered
    pub fn is_registered(&self) -> bool {
        self.registered.get() == 1
    }

    /// Render all metrics in the prometheus text format
    pub fn encode(&self) -> Result<(Vec<u8>, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        let metrics = PluginMetrics::new().unwrap();
        metrics.restarts_total.inc();
        metrics.registrations_total.with_label_values(&["success"]).inc();
        metrics.devices.set(2);

        let (body, content_type) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("sata_plugin_restarts_total 1"));
        assert!(text.contains("sata_plugin_registrations_total{result=\"success\"} 1"));
        assert!(text.contains("sata_plugin_devices 2"));
    }

    #[test]
    fn test_independent_registries() {
        let first = PluginMetrics::new().unwrap();
        let second = PluginMetrics::new().unwrap();

        first.registered.set(1);
        assert!(first.is_registered());
        assert!(!second.is_registered());
    }
}
