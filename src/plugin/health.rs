//! Device Health
//!
//! The device table of a plugin instance has exactly one writer: the
//! health applier task. Everything else asks for a device to be marked
//! unhealthy by pushing its id onto the instance's health queue, and every
//! ListAndWatch stream observes the published device list.
//!
//! There is no transition back to `Healthy`. A device marked unhealthy
//! stays unhealthy until the supervisor rebuilds the plugin.

use crate::domain::ports::{Device, Health};
use crate::metrics::PluginMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Device Table
// =============================================================================

/// Outcome of applying one health update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// The device went from healthy to unhealthy
    MarkedUnhealthy,
    /// The device was already unhealthy
    AlreadyUnhealthy,
    /// No device with that id
    UnknownDevice,
}

/// Published device list of one plugin instance
pub struct DeviceTable {
    tx: watch::Sender<Vec<Device>>,
}

impl DeviceTable {
    /// Create a table holding the given devices
    pub fn new(devices: Vec<Device>) -> Self {
        let (tx, _) = watch::channel(devices);
        Self { tx }
    }

    /// Current device list
    pub fn snapshot(&self) -> Vec<Device> {
        self.tx.borrow().clone()
    }

    /// Subscribe to device list changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.tx.subscribe()
    }

    /// Number of exposed devices
    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    /// Check if no devices are exposed
    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Number of devices currently marked unhealthy
    pub fn unhealthy_count(&self) -> usize {
        self.tx.borrow().iter().filter(|d| !d.is_healthy()).count()
    }

    /// Mark a device unhealthy, notifying watchers only on an actual change
    fn mark_unhealthy(&self, id: &str) -> HealthUpdate {
        let mut outcome = HealthUpdate::UnknownDevice;

        self.tx.send_if_modified(|devices| {
            match devices.iter_mut().find(|d| d.id == id) {
                Some(device) if device.is_healthy() => {
                    device.health = Health::Unhealthy;
                    outcome = HealthUpdate::MarkedUnhealthy;
                    true
                }
                Some(_) => {
                    outcome = HealthUpdate::AlreadyUnhealthy;
                    false
                }
                None => false,
            }
        });

        outcome
    }
}

// =============================================================================
// Health Queue
// =============================================================================

/// Handle used to request that a device be marked unhealthy
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::UnboundedSender<String>,
}

impl HealthReporter {
    /// Queue an unhealthy notification for the device with `id`
    ///
    /// Returns false once the owning instance has stopped.
    pub fn mark_unhealthy(&self, id: impl Into<String>) -> bool {
        self.tx.send(id.into()).is_ok()
    }
}

/// Receiving side of the health queue, consumed by the applier task
#[derive(Debug)]
pub struct HealthUpdates {
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create a health queue
pub fn health_channel() -> (HealthReporter, HealthUpdates) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HealthReporter { tx }, HealthUpdates { rx })
}

/// Apply queued health updates to `table` until `stop` fires
pub(crate) async fn apply_health_updates(
    table: Arc<DeviceTable>,
    mut updates: HealthUpdates,
    stop: CancellationToken,
    metrics: PluginMetrics,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            update = updates.rx.recv() => {
                let Some(id) = update else { break };

                match table.mark_unhealthy(&id) {
                    HealthUpdate::MarkedUnhealthy => {
                        info!(device = %id, "Device marked unhealthy");
                        metrics.unhealthy_devices.set(table.unhealthy_count() as i64);
                    }
                    HealthUpdate::AlreadyUnhealthy => {
                        debug!(device = %id, "Device already unhealthy");
                    }
                    HealthUpdate::UnknownDevice => {
                        warn!(device = %id, "Health update for unknown device ignored");
                    }
                }
            }
        }
    }

    debug!("Health applier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table(count: usize) -> Arc<DeviceTable> {
        Arc::new(DeviceTable::new((0..count).map(Device::healthy).collect()))
    }

    #[test]
    fn test_mark_unhealthy_outcomes() {
        let table = table(2);

        assert_eq!(table.mark_unhealthy("1"), HealthUpdate::MarkedUnhealthy);
        assert_eq!(table.mark_unhealthy("1"), HealthUpdate::AlreadyUnhealthy);
        assert_eq!(table.mark_unhealthy("7"), HealthUpdate::UnknownDevice);

        let devices = table.snapshot();
        assert_eq!(devices[0].health, Health::Healthy);
        assert_eq!(devices[1].health, Health::Unhealthy);
        assert_eq!(table.unhealthy_count(), 1);
    }

    #[test]
    fn test_watchers_notified_only_on_change() {
        let table = table(1);
        let mut rx = table.subscribe();

        table.mark_unhealthy("9");
        assert!(!rx.has_changed().unwrap());

        table.mark_unhealthy("0");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()[0].health, Health::Unhealthy);

        table.mark_unhealthy("0");
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_applier_consumes_queue() {
        let table = table(3);
        let metrics = PluginMetrics::new().unwrap();
        let (reporter, updates) = health_channel();
        let stop = CancellationToken::new();
        let mut rx = table.subscribe();

        let task = tokio::spawn(apply_health_updates(
            table.clone(),
            updates,
            stop.clone(),
            metrics.clone(),
        ));

        assert!(reporter.mark_unhealthy("2"));
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.snapshot()[2].health, Health::Unhealthy);
        assert_eq!(metrics.unhealthy_devices.get(), 1);

        stop.cancel();
        task.await.unwrap();
        assert!(!reporter.mark_unhealthy("0"));
    }

    #[test]
    fn test_watcher_pending_until_change() {
        let table = table(2);
        let mut rx = table.subscribe();

        let mut changed = tokio_test::task::spawn(rx.changed());
        tokio_test::assert_pending!(changed.poll());

        table.mark_unhealthy("0");
        assert!(changed.is_woken());
        tokio_test::assert_ready_ok!(changed.poll());
    }
}
