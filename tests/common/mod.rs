//! Shared fixtures for the integration tests

#![allow(dead_code)]

use sata_device_plugin::proto::v1beta1::registration_server::{Registration, RegistrationServer};
use sata_device_plugin::proto::v1beta1::{Empty, RegisterRequest};
use sata_device_plugin::{DeviceDiscoverer, DiscoveredDevice, DiscoveryError, PluginConfig};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

pub fn disk(name: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        name: name.to_string(),
        path: format!("/dev/{}", name),
        size: "931.5G".to_string(),
        has_children: false,
    }
}

/// Discoverer whose device list can change between calls
#[derive(Clone)]
pub struct FakeDiscovery {
    devices: Arc<Mutex<Vec<DiscoveredDevice>>>,
}

impl FakeDiscovery {
    pub fn new(names: &[&str]) -> Self {
        Self {
            devices: Arc::new(Mutex::new(names.iter().map(|n| disk(n)).collect())),
        }
    }

    pub fn set(&self, names: &[&str]) {
        *self.devices.lock().unwrap() = names.iter().map(|n| disk(n)).collect();
    }
}

#[async_trait::async_trait]
impl DeviceDiscoverer for FakeDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// Discoverer that always fails
pub struct BrokenDiscovery;

#[async_trait::async_trait]
impl DeviceDiscoverer for BrokenDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        Err(DiscoveryError::CommandFailed {
            command: "lsblk -n -o name,size -J".to_string(),
            status: "exit status: 32".to_string(),
            output: "lsblk: failed to access sysfs directory".to_string(),
        })
    }
}

/// Config rooted in a test directory with short timeouts
pub fn test_config(dir: &Path) -> PluginConfig {
    PluginConfig {
        dial_timeout: Duration::from_millis(300),
        shutdown_timeout: Duration::from_secs(1),
        ..PluginConfig::with_plugin_dir(dir)
    }
}

struct RecordingRegistration {
    tx: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        let _ = self.tx.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint that records every request it receives
pub struct FakeKubelet {
    pub requests: mpsc::UnboundedReceiver<RegisterRequest>,
    stop: CancellationToken,
    server: JoinHandle<()>,
}

impl FakeKubelet {
    pub fn start(socket: &Path) -> Self {
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let shutdown = stop.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(RecordingRegistration { tx }))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                })
                .await
                .unwrap();
        });

        Self {
            requests,
            stop,
            server,
        }
    }

    /// Wait for the next registration request
    pub async fn next_request(&mut self) -> RegisterRequest {
        tokio::time::timeout(Duration::from_secs(10), self.requests.recv())
            .await
            .expect("no registration within 10s")
            .expect("fake kubelet closed")
    }

    /// Check that no registration arrives within `wait`
    pub async fn assert_quiet(&mut self, wait: Duration) {
        let next = tokio::time::timeout(wait, self.requests.recv()).await;
        assert!(next.is_err(), "unexpected registration: {:?}", next);
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.server.await;
    }
}
