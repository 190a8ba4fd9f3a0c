//! Device Plugin gRPC Service
//!
//! Implements the kubelet-facing `DevicePlugin` service: options, the
//! ListAndWatch stream, Allocate and PreStartContainer.

use super::health::DeviceTable;
use crate::domain::ports::{Device, DeviceDiscoverer, DiscoveredDevice};
use crate::error::{Error, Result};
use crate::metrics::PluginMetrics;
use crate::proto::v1beta1::{
    self, device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerAllocateResponse, DevicePluginOptions, DeviceSpec, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Cgroup permissions granted on every allocated device
pub const DEVICE_PERMISSIONS: &str = "rwm";

/// Buffered responses per ListAndWatch stream
const WATCH_STREAM_BUFFER: usize = 4;

impl From<&Device> for v1beta1::Device {
    fn from(device: &Device) -> Self {
        v1beta1::Device {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}

fn list_response(devices: &[Device]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: devices.iter().map(v1beta1::Device::from).collect(),
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Map each container request onto freshly discovered devices
///
/// The mapping is positional: the i-th requested id of a container gets the
/// i-th discovered device, so request order is preserved. Requesting more
/// devices than are currently discovered fails instead of returning a
/// wrong or missing device.
pub fn allocate_devices(
    request: &AllocateRequest,
    discovered: &[DiscoveredDevice],
) -> Result<AllocateResponse> {
    let mut container_responses = Vec::with_capacity(request.container_requests.len());

    for container in &request.container_requests {
        let requested = container.devices_ids.len();
        if requested > discovered.len() {
            return Err(Error::Allocation {
                requested,
                available: discovered.len(),
            });
        }

        let devices = discovered
            .iter()
            .take(requested)
            .map(|device| DeviceSpec {
                container_path: device.path.clone(),
                host_path: device.path.clone(),
                permissions: DEVICE_PERMISSIONS.to_string(),
            })
            .collect();

        container_responses.push(ContainerAllocateResponse {
            devices,
            ..Default::default()
        });
    }

    Ok(AllocateResponse {
        container_responses,
    })
}

// =============================================================================
// Service
// =============================================================================

/// Decrements the open stream gauge when a ListAndWatch stream ends
struct StreamGauge(PluginMetrics);

impl Drop for StreamGauge {
    fn drop(&mut self) {
        self.0.watch_streams.dec();
    }
}

/// The `DevicePlugin` service of one plugin instance
pub struct DevicePluginService {
    devices: Arc<DeviceTable>,
    discoverer: Arc<dyn DeviceDiscoverer>,
    stop: CancellationToken,
    metrics: PluginMetrics,
    max_devices: Option<usize>,
}

impl DevicePluginService {
    /// Create a service over an instance's device table
    pub fn new(
        devices: Arc<DeviceTable>,
        discoverer: Arc<dyn DeviceDiscoverer>,
        stop: CancellationToken,
        metrics: PluginMetrics,
        max_devices: Option<usize>,
    ) -> Self {
        Self {
            devices,
            discoverer,
            stop,
            metrics,
            max_devices,
        }
    }

    /// Re-run discovery for an allocation
    async fn rediscover(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut devices = self.discoverer.discover().await?;
        if let Some(max) = self.max_devices {
            devices.truncate(max);
        }
        Ok(devices)
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream = ReceiverStream<std::result::Result<ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(WATCH_STREAM_BUFFER);
        let mut updates = self.devices.subscribe();
        let stop = self.stop.clone();

        self.metrics.watch_streams.inc();
        let gauge = StreamGauge(self.metrics.clone());

        tokio::spawn(async move {
            let _gauge = gauge;

            let initial = list_response(&updates.borrow_and_update());
            info!(devices = initial.devices.len(), "Exposing devices");
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("Plugin stopping, closing ListAndWatch stream");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("ListAndWatch client went away");
                        break;
                    }
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let response = list_response(&updates.borrow_and_update());
                        debug!(devices = response.devices.len(), "Resending device list");
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        debug!(?request, "Allocate request");

        let allocation = match self.rediscover().await {
            Ok(discovered) => allocate_devices(&request, &discovered),
            Err(e) => Err(e),
        };

        match allocation {
            Ok(response) => {
                self.metrics.allocations_total.with_label_values(&["success"]).inc();
                debug!(?response, "Allocate response");
                Ok(Response::new(response))
            }
            Err(e) => {
                self.metrics.allocations_total.with_label_values(&["failure"]).inc();
                warn!(error = %e, "Allocate failed");
                Err(e.into())
            }
        }
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
