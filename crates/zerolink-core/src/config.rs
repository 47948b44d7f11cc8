//! Centralized configuration for zerolink.
//!
//! Static tunables live as associated constants on unit structs. Runtime options
//! for running a container ([`RunConfig`]) and for building a cluster proxy
//! ([`ClusterServiceConfig`]) are plain serde structs so they can be loaded from
//! a JSON file.

use crate::transport::Endpoint;
use crate::{Result, ZerolinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Wire-level limits and timings.
pub struct TransportConfig;

impl TransportConfig {
    /// Maximum size of a single frame (64MB).
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
    /// Delay between attempts while a subscriber waits for its publisher.
    pub const SUBSCRIBE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
    /// How long a subscriber waits for the publisher's acknowledgement.
    pub const SUBSCRIBE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    /// Buffer size of one in-process duplex pipe.
    pub const INPROC_BUFFER_SIZE: usize = 64 * 1024;
    /// Topic messages queued per subscriber (or broker relay) before new ones
    /// are dropped.
    pub const PUBLISH_QUEUE_CAPACITY: usize = 256;
    /// Idle request connections kept per endpoint.
    pub const MAX_IDLE_REQUEST_CONNECTIONS: usize = 4;
}

/// Reply server defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    /// Number of requests a container dispatches concurrently.
    pub const DEFAULT_WORKERS: usize = 1;
}

/// Supervisor timings.
pub struct RunnerConfig;

impl RunnerConfig {
    /// Interval between two liveness scans of the supervised workers.
    pub const LOOP_WAIT_TIME: Duration = Duration::from_secs(1);
    /// How long after a stop request a container that is still starting may
    /// take before its worker is aborted.
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
}

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// TCP sockets.
    #[default]
    Tcp,
    /// In-process pipes, only reachable from the same process.
    Inproc,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Inproc => "inproc",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Scheme::Tcp),
            "inproc" => Some(Scheme::Inproc),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_host() -> String {
    ServerConfig::DEFAULT_HOST.to_string()
}

fn default_workers() -> usize {
    ServerConfig::DEFAULT_WORKERS
}

/// Options accepted by [`Container::run`](crate::Container::run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Host the reply endpoint binds to (`*` binds every interface).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the reply endpoint (0 lets the OS pick one).
    pub port: u16,
    /// Host of the publisher (or broker) this container subscribes to.
    #[serde(default)]
    pub event_host: Option<String>,
    /// Port of the publisher (or broker) this container subscribes to.
    #[serde(default)]
    pub event_port: Option<u16>,
    /// Maximum number of requests dispatched concurrently.
    ///
    /// The limit is shared by every client connection: with the default of one
    /// worker a slow call holds up every other caller, and a handler calling
    /// back into its own container waits forever.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub protocol: Scheme,
    #[serde(default)]
    pub events_protocol: Scheme,
    /// Relay events through a broker instead of binding as their origin.
    #[serde(default)]
    pub through_broker: bool,
}

impl RunConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            event_host: None,
            event_port: None,
            workers: ServerConfig::DEFAULT_WORKERS,
            protocol: Scheme::Tcp,
            events_protocol: Scheme::Tcp,
            through_broker: false,
        }
    }

    pub fn with_events(mut self, host: impl Into<String>, port: u16) -> Self {
        self.event_host = Some(host.into());
        self.event_port = Some(port);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_protocol(mut self, protocol: Scheme) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_events_protocol(mut self, protocol: Scheme) -> Self {
        self.events_protocol = protocol;
        self
    }

    pub fn through_broker(mut self, through_broker: bool) -> Self {
        self.through_broker = through_broker;
        self
    }

    /// Endpoint of the reply socket.
    pub fn rpc_endpoint(&self) -> Endpoint {
        Endpoint::new(self.protocol, &self.host, self.port)
    }

    /// Endpoint to subscribe to, only when both event host and port are set.
    pub fn event_endpoint(&self) -> Option<Endpoint> {
        match (&self.event_host, self.event_port) {
            (Some(host), Some(port)) if !host.is_empty() => {
                Some(Endpoint::new(self.events_protocol, host, port))
            }
            _ => None,
        }
    }
}

/// One entry of a static cluster description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterServiceConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Scheme,
}

impl ClusterServiceConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            protocol: Scheme::Tcp,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.protocol, &self.host, self.port)
    }

    /// Load a cluster description (a JSON array of entries) from a file.
    pub fn load_list(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ZerolinkError::Config {
            message: format!("Failed to read cluster config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| ZerolinkError::Config {
            message: format!("Invalid cluster config {}: {}", path.display(), e),
        })
    }
}
