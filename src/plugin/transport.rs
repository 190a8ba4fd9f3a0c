//! Unix socket gRPC transport
//!
//! Both the plugin's readiness check and the kubelet registration dial a
//! unix socket and keep retrying until a connection is up or the timeout
//! expires.

use crate::error::{Error, Result};
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::trace;

/// Pause between connection attempts while dialing
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Placeholder authority; the connector below ignores it
const UNIX_ENDPOINT_URI: &str = "http://[::]:50051";

/// Establish a gRPC channel over the unix socket at `socket`
///
/// Blocks until the socket accepts a connection, retrying every 100ms, and
/// fails once `timeout` has elapsed.
pub async fn dial(socket: &Path, timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::try_from(UNIX_ENDPOINT_URI)?.connect_timeout(timeout);
    let mut last_error: Option<String> = None;

    let attempt = async {
        loop {
            let path = socket.to_path_buf();
            let connector = service_fn(move |_: Uri| {
                let path = path.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            });

            match endpoint.connect_with_connector(connector).await {
                Ok(channel) => return channel,
                Err(e) => {
                    trace!(socket = %socket.display(), error = %e, "Dial attempt failed");
                    last_error = Some(e.to_string());
                    tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                }
            }
        }
    };

    let outcome = tokio::time::timeout(timeout, attempt).await;
    match outcome {
        Ok(channel) => Ok(channel),
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!(
                "timed out after {:?} dialing {}: {}",
                timeout,
                socket.display(),
                last_error.unwrap_or_else(|| "no connection attempt completed".to_string())
            ),
        ))),
    }
}
