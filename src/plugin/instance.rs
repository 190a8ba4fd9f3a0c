//! Plugin Instance
//!
//! One build of the device plugin: the devices discovered at build time,
//! the gRPC server bound to the plugin socket, and the stop signal shared
//! by the server and every ListAndWatch stream.
//!
//! ```text
//! Unbuilt ──build──▶ Starting ──start──▶ Serving ──stop──▶ Stopping ──▶ Stopped
//! ```

use super::config::PluginConfig;
use super::health::{apply_health_updates, health_channel, DeviceTable, HealthReporter, HealthUpdates};
use super::registration::{register, registration_request};
use super::service::DevicePluginService;
use super::transport::dial;
use crate::domain::ports::{Device, DeviceDiscoverer};
use crate::error::{Error, Result};
use crate::metrics::PluginMetrics;
use crate::proto::v1beta1::device_plugin_server::DevicePluginServer;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

// =============================================================================
// Plugin State
// =============================================================================

/// Lifecycle state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// No instance has been built yet
    Unbuilt,
    /// Built, server not running
    Starting,
    /// Server running and accepting connections
    Serving,
    /// Tearing down
    Stopping,
    /// Torn down; a new instance is needed for another cycle
    Stopped,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Unbuilt => write!(f, "unbuilt"),
            PluginState::Starting => write!(f, "starting"),
            PluginState::Serving => write!(f, "serving"),
            PluginState::Stopping => write!(f, "stopping"),
            PluginState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Remove a socket file, treating absence as success
fn remove_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Plugin Instance
// =============================================================================

type ServerHandle = JoinHandle<std::result::Result<(), tonic::transport::Error>>;

/// A single build of the device plugin
pub struct PluginInstance {
    config: Arc<PluginConfig>,
    discoverer: Arc<dyn DeviceDiscoverer>,
    metrics: PluginMetrics,
    state: PluginState,
    devices: Arc<DeviceTable>,
    socket_path: PathBuf,
    stop: CancellationToken,
    reporter: HealthReporter,
    updates: Option<HealthUpdates>,
    server: Option<ServerHandle>,
    health_task: Option<JoinHandle<()>>,
    built_at: DateTime<Utc>,
}

impl PluginInstance {
    /// Discover devices and assign them positional ids
    ///
    /// Every discovered device starts out healthy. Fails with
    /// [`Error::Build`] when discovery fails; nothing is started.
    pub async fn build(
        config: Arc<PluginConfig>,
        discoverer: Arc<dyn DeviceDiscoverer>,
        metrics: PluginMetrics,
    ) -> Result<Self> {
        let mut discovered = discoverer.discover().await.map_err(Error::Build)?;
        if let Some(max) = config.max_devices {
            discovered.truncate(max);
        }

        let devices: Vec<Device> = (0..discovered.len()).map(Device::healthy).collect();
        info!(
            count = devices.len(),
            devices = ?discovered.iter().map(|d| d.path.as_str()).collect::<Vec<_>>(),
            "Built device plugin"
        );

        let (reporter, updates) = health_channel();

        Ok(Self {
            socket_path: config.socket_path(),
            config,
            discoverer,
            metrics,
            state: PluginState::Starting,
            devices: Arc::new(DeviceTable::new(devices)),
            stop: CancellationToken::new(),
            reporter,
            updates: Some(updates),
            server: None,
            health_task: None,
            built_at: Utc::now(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Devices with their current health
    pub fn devices(&self) -> Vec<Device> {
        self.devices.snapshot()
    }

    /// Path of the plugin socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// When this instance was built
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Handle for marking devices of this instance unhealthy
    pub fn health_reporter(&self) -> HealthReporter {
        self.reporter.clone()
    }

    /// Bind the plugin socket, start the gRPC server and wait until it accepts
    ///
    /// A stale socket file at the target path is removed first. Fails with
    /// [`Error::Start`] when binding or the readiness dial fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != PluginState::Starting {
            return Err(Error::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        let socket = self.socket_path.display().to_string();
        let start_error = |reason: String| Error::Start {
            socket: socket.clone(),
            reason,
        };

        remove_socket(&self.socket_path).map_err(|e| start_error(e.to_string()))?;
        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| start_error(e.to_string()))?;

        let service = DevicePluginService::new(
            self.devices.clone(),
            self.discoverer.clone(),
            self.stop.clone(),
            self.metrics.clone(),
            self.config.max_devices,
        );

        let shutdown = self.stop.clone();
        self.server = Some(tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                })
                .await
        }));

        if let Some(updates) = self.updates.take() {
            self.health_task = Some(tokio::spawn(apply_health_updates(
                self.devices.clone(),
                updates,
                self.stop.clone(),
                self.metrics.clone(),
            )));
        }

        // Wait for the server to come up by dialing it
        let channel = dial(&self.socket_path, self.config.dial_timeout)
            .await
            .map_err(|e| start_error(e.to_string()))?;
        drop(channel);

        self.state = PluginState::Serving;
        self.metrics.devices.set(self.devices.len() as i64);
        self.metrics
            .unhealthy_devices
            .set(self.devices.unhealthy_count() as i64);
        Ok(())
    }

    /// Announce this instance to the kubelet
    pub async fn register(&self) -> Result<()> {
        if self.state != PluginState::Serving {
            return Err(Error::InvalidState {
                operation: "register",
                state: self.state,
            });
        }

        let request = registration_request(
            &self.config.api_version,
            &self.socket_path,
            &self.config.resource_name,
        );
        register(
            &self.config.kubelet_socket_path(),
            request,
            self.config.dial_timeout,
        )
        .await
    }

    /// Start the server and register it with the kubelet
    ///
    /// When registration fails the instance is stopped again before the
    /// error is returned.
    pub async fn serve(&mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Could not start device plugin");
            return Err(e);
        }
        info!(socket = %self.socket_path.display(), "Starting to serve");

        if let Err(e) = self.register().await {
            error!(error = %e, "Could not register device plugin");
            if let Err(stop_err) = self.stop().await {
                warn!(error = %stop_err, "Failed to stop unregistered device plugin");
            }
            return Err(e);
        }

        info!(
            resource = %self.config.resource_name,
            "Registered device plugin with kubelet"
        );
        Ok(())
    }

    /// Stop the server, end every ListAndWatch stream and remove the socket
    ///
    /// Idempotent: stopping a stopped or never started instance succeeds
    /// without doing anything. The socket file is only removed after the
    /// server task has finished.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == PluginState::Stopped {
            return Ok(());
        }

        let Some(mut server) = self.server.take() else {
            // Never started
            self.stop.cancel();
            self.state = PluginState::Stopped;
            return Ok(());
        };

        self.state = PluginState::Stopping;
        self.stop.cancel();

        match tokio::time::timeout(self.config.shutdown_timeout, &mut server).await {
            Ok(Ok(Ok(()))) => debug!("gRPC server stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "gRPC server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "gRPC server task failed"),
            Err(_) => {
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "gRPC server did not drain in time, aborting"
                );
                server.abort();
                let _ = server.await;
            }
        }

        if let Some(task) = self.health_task.take() {
            let _ = task.await;
        }

        self.state = PluginState::Stopped;
        self.metrics.devices.set(0);
        self.metrics.unhealthy_devices.set(0);

        remove_socket(&self.socket_path)?;
        info!(
            socket = %self.socket_path.display(),
            built_at = %self.built_at.to_rfc3339(),
            uptime_secs = (Utc::now() - self.built_at).num_seconds(),
            "Device plugin stopped"
        );
        Ok(())
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("state", &self.state)
            .field("socket_path", &self.socket_path)
            .field("devices", &self.devices.len())
            .field("built_at", &self.built_at)
            .finish_non_exhaustive()
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        // Tasks end on their own; the socket file is left for stop()
        self.stop.cancel();
    }
}
