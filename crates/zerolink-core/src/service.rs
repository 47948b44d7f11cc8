//! The service interface a [`Container`](crate::Container) hosts.

use crate::protocol::Protocol;
use crate::proxy::RpcProxy;
use crate::{Result, ZerolinkError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// What a service gets when its container creates it.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    protocol: Arc<Protocol>,
    settings: Arc<Value>,
}

impl ServiceContext {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Self {
            protocol,
            settings: Arc::new(Value::Null),
        }
    }

    /// Settings of the hosting container (see
    /// [`Container::with_settings`](crate::Container::with_settings)).
    pub fn with_settings(mut self, settings: Arc<Value>) -> Self {
        self.settings = settings;
        self
    }

    /// The container's protocol; event dispatchers publish through it.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Raw settings, `null` when the container has none.
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Settings deserialized as `T`, or `None` when the container has none.
    pub fn settings_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.settings.is_null() {
            return Ok(None);
        }
        T::deserialize(self.settings.as_ref())
            .map(Some)
            .map_err(|e| ZerolinkError::Config {
                message: format!("Invalid service settings: {}", e),
            })
    }
}

/// A value whose registered methods are callable remotely.
///
/// `CLASS` forms the method keys (`CLASS.method`), [`name`](Self::name) is the
/// service name events are published under.
#[async_trait]
pub trait Service: Send + Sync + Sized + 'static {
    const CLASS: &'static str;

    fn name(&self) -> &str;

    /// Create the instance. Called by [`Container::init`](crate::Container::init)
    /// on every (re)start.
    async fn init(ctx: &ServiceContext) -> Result<Self>;

    /// A protocol of the service's own; the container's is used otherwise.
    fn protocol(&self) -> Option<Arc<Protocol>> {
        None
    }

    /// Proxies to other services. Those carrying an event endpoint mark the
    /// services this one subscribes to.
    fn proxies(&self) -> Vec<&RpcProxy> {
        Vec::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Limits {
        max_items: u32,
    }

    #[test]
    fn test_settings_absent_by_default() {
        let ctx = ServiceContext::new(Arc::new(Protocol::json()));
        assert!(ctx.settings().is_null());
        assert_eq!(ctx.settings_as::<Limits>().unwrap(), None);
    }

    #[test]
    fn test_settings_deserialize_per_context() {
        let protocol = Arc::new(Protocol::json());
        let small = ServiceContext::new(protocol.clone())
            .with_settings(Arc::new(json!({"max_items": 1})));
        let large = ServiceContext::new(protocol).with_settings(Arc::new(json!({"max_items": 50})));

        assert_eq!(small.settings_as::<Limits>().unwrap(), Some(Limits { max_items: 1 }));
        assert_eq!(large.settings_as::<Limits>().unwrap(), Some(Limits { max_items: 50 }));

        let broken = ServiceContext::new(Arc::new(Protocol::json()))
            .with_settings(Arc::new(json!({"max_items": "many"})));
        assert!(matches!(
            broken.settings_as::<Limits>(),
            Err(ZerolinkError::Config { .. })
        ));
    }
}
