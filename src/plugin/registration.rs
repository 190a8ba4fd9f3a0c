//! Kubelet Registration
//!
//! Announces a plugin to the kubelet over its registration socket.

use super::transport::dial;
use crate::error::{Error, Result};
use crate::proto::v1beta1::{
    registration_client::RegistrationClient, DevicePluginOptions, RegisterRequest,
};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Build the announcement for a plugin listening on `plugin_socket`
///
/// The endpoint is the socket's file name only; the kubelet resolves it
/// against its own device plugin directory.
pub fn registration_request(
    api_version: &str,
    plugin_socket: &Path,
    resource_name: &str,
) -> RegisterRequest {
    let endpoint = plugin_socket
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    RegisterRequest {
        version: api_version.to_string(),
        endpoint,
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    }
}

/// Register with the kubelet listening on `kubelet_socket`
pub async fn register(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<()> {
    let to_register_error = |reason: String| Error::Register {
        endpoint: kubelet_socket.display().to_string(),
        reason,
    };

    let channel = dial(kubelet_socket, timeout)
        .await
        .map_err(|e| to_register_error(e.to_string()))?;

    debug!(
        endpoint = %request.endpoint,
        resource = %request.resource_name,
        "Sending registration request"
    );

    let mut client = RegistrationClient::new(channel);
    client
        .register(request)
        .await
        .map_err(|status| to_register_error(status.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_request_uses_socket_basename() {
        let request = registration_request(
            "v1beta1",
            Path::new("/var/lib/kubelet/device-plugins/sata.sock"),
            "kairen.github.io/sata",
        );

        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "sata.sock");
        assert_eq!(request.resource_name, "kairen.github.io/sata");
        assert!(request.options.is_some());
    }

    #[tokio::test]
    async fn test_register_without_kubelet_fails() {
        let dir = tempfile::tempdir().unwrap();
        let request = registration_request("v1beta1", &dir.path().join("sata.sock"), "x/sata");

        let result = register(
            &dir.path().join("kubelet.sock"),
            request,
            Duration::from_millis(200),
        )
        .await;
        assert_matches!(result, Err(Error::Register { .. }));
    }
}
