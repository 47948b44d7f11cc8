//! Node configuration: an optional JSON file, overridden by CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zerolink::config::ServerConfig;
use zerolink::{Endpoint, RunConfig, Scheme};

fn default_container() -> RunConfig {
    RunConfig::new(ServerConfig::DEFAULT_HOST, 0)
}

fn default_host() -> String {
    ServerConfig::DEFAULT_HOST.to_string()
}

/// Where the math service publishes its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Scheme,
    /// Connect to a broker frontend instead of binding the publisher.
    #[serde(default)]
    pub through_broker: bool,
}

impl PublishConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.protocol, &self.host, self.port)
    }
}

/// Contents of a `--config` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Options of the hosted container.
    #[serde(default = "default_container")]
    pub container: RunConfig,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            container: default_container(),
            publish: None,
        }
    }
}

/// Values given on the command line; each one replaces its file counterpart.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub event_host: Option<String>,
    pub event_port: Option<u16>,
    pub publish_port: Option<u16>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        let container = &mut self.container;
        if let Some(host) = overrides.host {
            container.host = host;
        }
        if let Some(port) = overrides.port {
            container.port = port;
        }
        if let Some(workers) = overrides.workers {
            container.workers = workers;
        }
        if let Some(event_host) = overrides.event_host {
            container.event_host = Some(event_host);
        }
        if let Some(event_port) = overrides.event_port {
            container.event_port = Some(event_port);
        }

        if let Some(port) = overrides.publish_port {
            match &mut self.publish {
                Some(publish) => publish.port = port,
                None => {
                    self.publish = Some(PublishConfig {
                        host: self.container.host.clone(),
                        port,
                        protocol: self.container.events_protocol,
                        through_broker: self.container.through_broker,
                    })
                }
            }
        }
        self
    }
}
