//! SATA Device Plugin
//!
//! Exposes whole SATA disks of the host to the kubelet through the device
//! plugin API and keeps the registration alive across kubelet restarts.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use sata_device_plugin::{
    DeviceFilter, Error, HostEvents, LsblkDiscovery, PluginConfig, PluginMetrics,
    RegistrationRetry, Result, Supervisor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SATA Device Plugin - exposes host SATA disks as a kubelet extended resource
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the kubelet and plugin sockets
    #[arg(long, env = "PLUGIN_DIR", default_value = "/var/lib/kubelet/device-plugins/")]
    plugin_dir: PathBuf,

    /// File name of the plugin socket
    #[arg(long, env = "SOCKET_NAME", default_value = "sata.sock")]
    socket_name: String,

    /// File name of the kubelet registration socket
    #[arg(long, env = "KUBELET_SOCKET_NAME", default_value = "kubelet.sock")]
    kubelet_socket_name: String,

    /// Extended resource name advertised to the kubelet
    #[arg(long, env = "RESOURCE_NAME", default_value = "kairen.github.io/sata")]
    resource_name: String,

    /// Timeout for dialing unix sockets, in seconds
    #[arg(long, env = "DIAL_TIMEOUT", default_value = "5")]
    dial_timeout_secs: u64,

    /// Expose at most this many devices
    #[arg(long, env = "MAX_DEVICES")]
    max_devices: Option<usize>,

    /// Command printing the block device list as JSON
    #[arg(long, env = "DISCOVERY_COMMAND", default_value = "lsblk -n -o name,size -J")]
    discovery_command: String,

    /// Kernel name prefix of eligible disks
    #[arg(long, env = "DEVICE_PREFIX", default_value = "sd")]
    device_prefix: String,

    /// Back off exponentially between registration attempts
    #[arg(long, env = "REGISTER_BACKOFF")]
    register_backoff: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn plugin_config(&self) -> PluginConfig {
        let mut config = PluginConfig::with_plugin_dir(&self.plugin_dir);
        config.socket_name = self.socket_name.clone();
        config.kubelet_socket_name = self.kubelet_socket_name.clone();
        config.resource_name = self.resource_name.clone();
        config.dial_timeout = Duration::from_secs(self.dial_timeout_secs);
        config.max_devices = self.max_devices;
        if self.register_backoff {
            config.registration_retry = RegistrationRetry::backoff();
        }
        config.discovery.command = self.discovery_command.clone();
        config.discovery.filter = DeviceFilter::with_prefix(&self.device_prefix);
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    if let Err(e) = run(args).await {
        error!(error = %e, "Device plugin exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting SATA device plugin");
    info!("  Version: {}", sata_device_plugin::VERSION);
    info!("  Plugin dir: {}", args.plugin_dir.display());
    info!("  Resource: {}", args.resource_name);

    let config = args.plugin_config();
    let metrics = PluginMetrics::new()?;

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_metrics).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Fetching devices");
    let discoverer = Arc::new(LsblkDiscovery::new(config.discovery.clone()));

    info!("Starting filesystem and signal watchers");
    let mut events = HostEvents::new(&config)?;

    let mut supervisor = Supervisor::new(config, discoverer, metrics);
    supervisor.run(&mut events).await?;

    info!("Device plugin shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["h2=warn", "hyper=warn", "tower=warn", "tonic=info"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, metrics: PluginMetrics) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registered = metrics.is_registered();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if registered => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not registered"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };

                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: PluginMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((buffer, content_type)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
