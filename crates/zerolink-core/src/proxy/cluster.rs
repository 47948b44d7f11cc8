//! Named set of proxies built from a static cluster description.

use super::RpcProxy;
use crate::config::ClusterServiceConfig;
use crate::{Result, ZerolinkError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// One [`RpcProxy`] per configured service, all of them in async mode.
#[derive(Debug)]
pub struct ClusterProxy {
    services: BTreeMap<String, RpcProxy>,
}

impl ClusterProxy {
    /// Build a proxy per entry. A later entry replaces an earlier one of the
    /// same name.
    pub fn new(configs: impl IntoIterator<Item = ClusterServiceConfig>) -> Self {
        let services = configs
            .into_iter()
            .map(|config| {
                let proxy = RpcProxy::new(config.name.as_str(), config.endpoint());
                proxy.set_async_context(true);
                (config.name, proxy)
            })
            .collect();
        Self { services }
    }

    /// Build from a JSON file holding an array of `{name, host, port}` entries.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(ClusterServiceConfig::load_list(path)?))
    }

    /// The proxy of service `name`.
    pub fn service(&self, name: &str) -> Result<&RpcProxy> {
        self.services
            .get(name)
            .ok_or_else(|| ZerolinkError::ServiceNotFound {
                name: name.to_string(),
            })
    }

    /// Configured service names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Close the async connections of every proxy. The proxies stay usable.
    pub fn close(&self) {
        for proxy in self.services.values() {
            proxy.close_connections();
        }
        debug!("Closed cluster connections of {} service(s)", self.services.len());
    }
}

impl Drop for ClusterProxy {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterProxy {
        ClusterProxy::new(vec![
            ClusterServiceConfig::new("math", "127.0.0.1", 5555),
            ClusterServiceConfig::new("users", "127.0.0.1", 5556),
        ])
    }

    #[test]
    fn test_unknown_service_is_named_in_error() {
        let err = cluster().service("billing").unwrap_err();
        assert!(matches!(&err, ZerolinkError::ServiceNotFound { name } if name == "billing"));
        assert_eq!(err.to_string(), "Service billing is not found");
    }

    #[test]
    fn test_proxies_start_in_async_mode() {
        let cluster = cluster();
        assert_eq!(cluster.names(), vec!["math", "users"]);

        let math = cluster.service("math").unwrap();
        assert!(math.is_async_context());
        assert_eq!(math.endpoint().port(), 5555);
    }

    #[test]
    fn test_scope_on_member_keeps_async_mode() {
        let cluster = cluster();
        let math = cluster.service("math").unwrap();
        drop(math.enter_async());

        assert!(math.is_async_context());
        assert_eq!(math.open_connections(), 0);
    }

    #[test]
    fn test_from_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"[{"name": "math", "port": 7000}]"#).unwrap();

        let cluster = ClusterProxy::from_config_file(&path).unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.service("math").unwrap().endpoint().to_string(), "tcp://127.0.0.1:7000");
    }
}
