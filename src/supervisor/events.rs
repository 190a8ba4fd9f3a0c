//! Supervisor Events
//!
//! Filesystem changes in the device plugin directory and process signals
//! are merged into one stream of [`SupervisorEvent`]s so the supervisor has
//! a single decision point. Whichever event arrives first wins the
//! iteration.

use crate::error::Result;
use crate::plugin::PluginConfig;
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

// =============================================================================
// Events
// =============================================================================

/// Signal that asks the supervisor to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
        }
    }
}

/// Something the supervisor has to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The kubelet (re)created its registration socket
    RuntimeSocketCreated,
    /// The plugin socket was deleted
    PluginSocketRemoved,
    /// The filesystem watcher reported an error
    WatchError(String),
    /// SIGHUP
    Reload,
    /// SIGINT, SIGTERM or SIGQUIT
    Shutdown(ShutdownSignal),
}

impl SupervisorEvent {
    /// Check if this event asks for the plugin to be rebuilt
    pub fn requests_restart(&self) -> bool {
        matches!(
            self,
            SupervisorEvent::RuntimeSocketCreated
                | SupervisorEvent::PluginSocketRemoved
                | SupervisorEvent::Reload
        )
    }
}

/// Map a raw filesystem event to a supervisor event
///
/// Only the creation of the kubelet socket and the removal of the plugin
/// socket are of interest; everything else maps to `None`.
pub fn classify_fs_event(
    event: &notify::Event,
    kubelet_socket_name: &str,
    plugin_socket_name: &str,
) -> Option<SupervisorEvent> {
    let touches = |name: &str| {
        event
            .paths
            .iter()
            .any(|path| path.file_name().is_some_and(|n| n == name))
    };

    match event.kind {
        EventKind::Create(_) if touches(kubelet_socket_name) => {
            Some(SupervisorEvent::RuntimeSocketCreated)
        }
        EventKind::Remove(_) if touches(plugin_socket_name) => {
            Some(SupervisorEvent::PluginSocketRemoved)
        }
        _ => None,
    }
}

// =============================================================================
// Event Sources
// =============================================================================

/// A merged stream of supervisor events
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next event; `None` once every source has closed
    ///
    /// Must be cancel safe: dropping the returned future loses no event.
    async fn next_event(&mut self) -> Option<SupervisorEvent>;
}

/// Production event source: inotify on the plugin directory plus signals
pub struct HostEvents {
    /// Kept alive for the lifetime of the source; dropping it stops watching
    _watcher: RecommendedWatcher,
    fs_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    kubelet_socket_name: String,
    plugin_socket_name: String,
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl HostEvents {
    /// Watch the configured plugin directory and subscribe to signals
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let (fs_tx, fs_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = fs_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&config.plugin_dir, RecursiveMode::NonRecursive)?;
        info!(path = %config.plugin_dir.display(), "Watching device plugin directory");

        Ok(Self {
            _watcher: watcher,
            fs_rx,
            kubelet_socket_name: config.kubelet_socket_name.clone(),
            plugin_socket_name: config.socket_name.clone(),
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    fn classify(&self, event: &notify::Event) -> Option<SupervisorEvent> {
        classify_fs_event(event, &self.kubelet_socket_name, &self.plugin_socket_name)
    }
}

#[async_trait]
impl EventSource for HostEvents {
    async fn next_event(&mut self) -> Option<SupervisorEvent> {
        loop {
            tokio::select! {
                fs_event = self.fs_rx.recv() => match fs_event {
                    Some(Ok(event)) => {
                        if let Some(mapped) = self.classify(&event) {
                            return Some(mapped);
                        }
                        debug!(kind = ?event.kind, paths = ?event.paths, "Ignoring filesystem event");
                    }
                    Some(Err(e)) => return Some(SupervisorEvent::WatchError(e.to_string())),
                    None => return None,
                },
                Some(()) = self.hangup.recv() => return Some(SupervisorEvent::Reload),
                Some(()) = self.interrupt.recv() => {
                    return Some(SupervisorEvent::Shutdown(ShutdownSignal::Interrupt));
                }
                Some(()) = self.terminate.recv() => {
                    return Some(SupervisorEvent::Shutdown(ShutdownSignal::Terminate));
                }
                Some(()) = self.quit.recv() => {
                    return Some(SupervisorEvent::Shutdown(ShutdownSignal::Quit));
                }
            }
        }
    }
}

/// Event source fed through a channel, for embedding and tests
pub struct ChannelEvents {
    rx: mpsc::Receiver<SupervisorEvent>,
}

impl ChannelEvents {
    /// Create a channel-backed source and the sender feeding it
    pub fn new(capacity: usize) -> (mpsc::Sender<SupervisorEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEvents {
    async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.rx.recv().await
    }
}
