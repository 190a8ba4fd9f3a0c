//! Restart Supervisor
//!
//! The single control loop of the process. It owns the current plugin
//! instance and the `restart` flag, rebuilds the plugin when the kubelet
//! restarts, the plugin socket disappears or SIGHUP arrives, and stops it
//! on SIGINT, SIGTERM or SIGQUIT.
//!
//! RPC handlers never touch this state; they only see their own instance.

use super::events::{EventSource, SupervisorEvent};
use crate::domain::ports::DeviceDiscoverer;
use crate::error::Result;
use crate::metrics::PluginMetrics;
use crate::plugin::{PluginConfig, PluginInstance, PluginState, RegistrationRetry};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Whether the control loop keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Shutdown,
}

/// Owner of the plugin lifecycle
pub struct Supervisor {
    config: Arc<PluginConfig>,
    discoverer: Arc<dyn DeviceDiscoverer>,
    metrics: PluginMetrics,
    restart: bool,
    current: Option<PluginInstance>,
    backoff: Option<ExponentialBackoff>,
}

impl Supervisor {
    /// Create a supervisor; the first loop iteration builds the plugin
    pub fn new(
        config: PluginConfig,
        discoverer: Arc<dyn DeviceDiscoverer>,
        metrics: PluginMetrics,
    ) -> Self {
        let backoff = match config.registration_retry {
            RegistrationRetry::Immediate => None,
            RegistrationRetry::Backoff {
                initial_interval,
                max_interval,
            } => Some(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(initial_interval)
                    .with_max_interval(max_interval)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        };

        Self {
            config: Arc::new(config),
            discoverer,
            metrics,
            restart: true,
            current: None,
            backoff,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Check if a rebuild is pending
    pub fn restart_pending(&self) -> bool {
        self.restart
    }

    /// The current plugin instance, if one was built
    pub fn current(&self) -> Option<&PluginInstance> {
        self.current.as_ref()
    }

    /// Lifecycle state of the current instance
    pub fn plugin_state(&self) -> PluginState {
        self.current
            .as_ref()
            .map(PluginInstance::state)
            .unwrap_or(PluginState::Unbuilt)
    }

    /// Rebuild the plugin if a restart is pending
    ///
    /// The previous instance is stopped first (best effort). Build and start
    /// failures are returned as fatal errors. A registration failure leaves
    /// the restart pending so the next iteration tries again.
    pub async fn reconcile(&mut self) -> Result<()> {
        if !self.restart {
            return Ok(());
        }

        if let Some(mut previous) = self.current.take() {
            if let Err(e) = previous.stop().await {
                warn!(error = %e, "Failed to stop previous device plugin");
            }
        }
        self.metrics.registered.set(0);

        let mut instance = PluginInstance::build(
            self.config.clone(),
            self.discoverer.clone(),
            self.metrics.clone(),
        )
        .await?;
        self.metrics.restarts_total.inc();

        match instance.serve().await {
            Ok(()) => {
                self.restart = false;
                self.metrics.registered.set(1);
                self.metrics
                    .registrations_total
                    .with_label_values(&["success"])
                    .inc();
                if let Some(backoff) = self.backoff.as_mut() {
                    backoff.reset();
                }
                self.current = Some(instance);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    "Could not contact kubelet, retrying. Did you enable the device plugin feature gate?"
                );
                self.metrics
                    .registrations_total
                    .with_label_values(&["failure"])
                    .inc();
                self.current = Some(instance);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = instance.stop().await {
                    warn!(error = %stop_err, "Failed to stop device plugin after start failure");
                }
                Err(e)
            }
        }
    }

    /// Apply one event to the supervisor state
    pub async fn handle_event(&mut self, event: SupervisorEvent) -> LoopControl {
        match event {
            SupervisorEvent::RuntimeSocketCreated => {
                info!(
                    socket = %self.config.kubelet_socket_path().display(),
                    "inotify: kubelet socket created, restarting"
                );
                self.restart = true;
            }
            SupervisorEvent::PluginSocketRemoved => {
                let socket = self.config.socket_path();
                if socket.exists() {
                    // Removed and recreated by our own rebuild
                    debug!(socket = %socket.display(), "Plugin socket present, ignoring removal");
                } else {
                    info!(socket = %socket.display(), "inotify: plugin socket deleted, restarting");
                    self.restart = true;
                }
            }
            SupervisorEvent::WatchError(e) => {
                warn!(error = %e, "inotify error");
            }
            SupervisorEvent::Reload => {
                info!("Received SIGHUP, restarting");
                self.restart = true;
            }
            SupervisorEvent::Shutdown(signal) => {
                info!(%signal, "Received signal, shutting down");
                self.shutdown().await;
                return LoopControl::Shutdown;
            }
        }

        LoopControl::Continue
    }

    /// Stop the current instance
    pub async fn shutdown(&mut self) {
        if let Some(instance) = self.current.as_mut() {
            if let Err(e) = instance.stop().await {
                warn!(error = %e, "Failed to stop device plugin during shutdown");
            }
        }
        self.metrics.registered.set(0);
    }

    /// Pause before retrying a failed registration
    async fn retry_delay(&mut self) {
        match self.backoff.as_mut() {
            None => tokio::task::yield_now().await,
            Some(backoff) => {
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                debug!(?delay, "Waiting before retrying registration");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Run the control loop until a shutdown signal or until `events` closes
    ///
    /// Returns an error only for fatal build or start failures.
    pub async fn run<E>(&mut self, events: &mut E) -> Result<()>
    where
        E: EventSource + ?Sized,
    {
        loop {
            if self.restart {
                if let Err(e) = self.reconcile().await {
                    error!(error = %e, "Fatal device plugin error");
                    return Err(e);
                }
            }

            let event = if self.restart {
                // Registration failed: take a queued event if there is one,
                // otherwise go straight back to Start + Register
                tokio::select! {
                    biased;
                    event = events.next_event() => event,
                    _ = self.retry_delay() => continue,
                }
            } else {
                events.next_event().await
            };

            let Some(event) = event else {
                warn!("Event sources closed, shutting down");
                self.shutdown().await;
                return Ok(());
            };

            if self.handle_event(event).await == LoopControl::Shutdown {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DiscoveredDevice;
    use crate::error::{DiscoveryError, Error};
    use crate::supervisor::events::{ChannelEvents, ShutdownSignal};
    use assert_matches::assert_matches;
    use std::path::Path;
    use std::time::Duration;

    struct FixedDiscovery;

    #[async_trait::async_trait]
    impl DeviceDiscoverer for FixedDiscovery {
        async fn discover(&self) -> std::result::Result<Vec<DiscoveredDevice>, DiscoveryError> {
            Ok(vec![DiscoveredDevice {
                name: "sdb".to_string(),
                path: "/dev/sdb".to_string(),
                size: "1T".to_string(),
                has_children: false,
            }])
        }
    }

    struct BrokenDiscovery;

    #[async_trait::async_trait]
    impl DeviceDiscoverer for BrokenDiscovery {
        async fn discover(&self) -> std::result::Result<Vec<DiscoveredDevice>, DiscoveryError> {
            Err(DiscoveryError::MissingKey {
                key: "blockdevices".to_string(),
            })
        }
    }

    fn supervisor(dir: &Path, discoverer: Arc<dyn DeviceDiscoverer>) -> Supervisor {
        let config = PluginConfig {
            dial_timeout: Duration::from_millis(200),
            ..PluginConfig::with_plugin_dir(dir)
        };
        Supervisor::new(config, discoverer, PluginMetrics::new().unwrap())
    }

    #[test]
    fn test_new_supervisor_wants_restart() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), Arc::new(FixedDiscovery));

        assert!(sup.restart_pending());
        assert!(sup.current().is_none());
        assert_eq!(sup.plugin_state(), PluginState::Unbuilt);
    }

    #[tokio::test]
    async fn test_reconcile_without_kubelet_keeps_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));

        sup.reconcile().await.unwrap();

        assert!(sup.restart_pending());
        assert_eq!(sup.plugin_state(), PluginState::Stopped);
        assert!(!sup.config().socket_path().exists());
        assert!(!sup.metrics.is_registered());
        assert_eq!(
            sup.metrics
                .registrations_total
                .with_label_values(&["failure"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_build_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(BrokenDiscovery));
        let (_tx, mut events) = ChannelEvents::new(1);

        let result = sup.run(&mut events).await;
        assert_matches!(result, Err(Error::Build(_)));
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(&dir.path().join("missing"), Arc::new(FixedDiscovery));

        let result = sup.reconcile().await;
        assert_matches!(result, Err(Error::Start { .. }));
        assert!(sup.current().is_none());
    }

    #[tokio::test]
    async fn test_restart_events_set_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));

        for event in [
            SupervisorEvent::RuntimeSocketCreated,
            SupervisorEvent::Reload,
            SupervisorEvent::PluginSocketRemoved,
        ] {
            sup.restart = false;
            assert_eq!(sup.handle_event(event).await, LoopControl::Continue);
            assert!(sup.restart_pending());
        }
    }

    #[tokio::test]
    async fn test_socket_removed_ignored_while_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));
        std::fs::write(sup.config().socket_path(), b"").unwrap();
        sup.restart = false;

        sup.handle_event(SupervisorEvent::PluginSocketRemoved).await;
        assert!(!sup.restart_pending());
    }

    #[tokio::test]
    async fn test_watch_error_only_logged() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));
        sup.restart = false;

        let control = sup
            .handle_event(SupervisorEvent::WatchError("queue overflow".into()))
            .await;
        assert_eq!(control, LoopControl::Continue);
        assert!(!sup.restart_pending());
    }

    #[tokio::test]
    async fn test_shutdown_while_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));
        let (tx, mut events) = ChannelEvents::new(1);
        tx.send(SupervisorEvent::Shutdown(ShutdownSignal::Terminate))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), sup.run(&mut events))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sup.plugin_state(), PluginState::Stopped);
        assert!(!sup.config().socket_path().exists());
    }

    #[tokio::test]
    async fn test_closed_events_end_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(FixedDiscovery));
        let (tx, mut events) = ChannelEvents::new(1);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(10), sup.run(&mut events))
            .await
            .unwrap()
            .unwrap();
        assert!(!sup.metrics.is_registered());
    }

    #[test]
    fn test_backoff_retry_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig {
            registration_retry: RegistrationRetry::backoff(),
            ..PluginConfig::with_plugin_dir(dir.path())
        };
        let sup = Supervisor::new(config, Arc::new(FixedDiscovery), PluginMetrics::new().unwrap());
        assert!(sup.backoff.is_some());
    }
}
