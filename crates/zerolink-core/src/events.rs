//! Topic events between services.
//!
//! A publishing service owns an [`EventDispatcher`]; `dispatch("sum", 3)` from
//! service `math` goes out under the topic string `math:sum`. A consuming
//! service registers handlers keyed by `(publisher name, topic)` in an
//! [`EventRegistry`] and its container subscribes to exactly those topics.

use crate::marshal::Fault;
use crate::protocol::Protocol;
use crate::transport::Endpoint;
use crate::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// `(service name, topic)`, `name:topic` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub service: String,
    pub topic: String,
}

impl EventKey {
    pub fn new(service: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            topic: topic.into(),
        }
    }

    /// Split a wire topic at its first `:`.
    pub fn parse(wire: &str) -> Option<Self> {
        let (service, topic) = wire.split_once(':')?;
        Some(Self::new(service, topic))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.topic)
    }
}

pub type EventFuture = BoxFuture<'static, std::result::Result<(), Fault>>;

/// Receives the consuming service instance and the event payload.
pub type EventHandler<S> = Arc<dyn Fn(Arc<S>, Value) -> EventFuture + Send + Sync>;

/// Event handlers of service `S`.
pub struct EventRegistry<S> {
    handlers: HashMap<EventKey, EventHandler<S>>,
}

impl<S: Send + Sync + 'static> EventRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `topic` published by `service`.
    ///
    /// The first registration for a key wins; returns `false` when the key was
    /// already taken and the handler was ignored.
    pub fn register<F, Fut>(&mut self, service: &str, topic: &str, handler: F) -> bool
    where
        F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Fault>> + Send + 'static,
    {
        let key = EventKey::new(service, topic);
        if self.handlers.contains_key(&key) {
            debug!("Handler for {} already registered, ignoring", key);
            return false;
        }
        let handler: EventHandler<S> = Arc::new(move |svc, payload| Box::pin(handler(svc, payload)));
        self.handlers.insert(key, handler);
        true
    }

    pub fn get(&self, key: &EventKey) -> Option<&EventHandler<S>> {
        self.handlers.get(key)
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Wire topics (`name:topic`) handled for `publisher`, sorted.
    pub fn topics_for(&self, publisher: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .keys()
            .filter(|key| key.service == publisher)
            .map(EventKey::to_string)
            .collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S: Send + Sync + 'static> Default for EventRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for EventRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Publishes a service's events on its publish endpoint.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    service: String,
    endpoint: Endpoint,
    through_broker: bool,
    protocol: Arc<Protocol>,
}

impl EventDispatcher {
    /// A dispatcher that binds (or connects to the broker) on first dispatch.
    pub fn new(
        service: impl Into<String>,
        endpoint: Endpoint,
        through_broker: bool,
        protocol: Arc<Protocol>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint,
            through_broker,
            protocol,
        }
    }

    /// A dispatcher whose publisher is bound right away, so subscribers can
    /// connect before the first event. Relaying dispatchers connect lazily.
    pub async fn bind(
        service: impl Into<String>,
        endpoint: Endpoint,
        through_broker: bool,
        protocol: Arc<Protocol>,
    ) -> Result<Self> {
        let endpoint = if through_broker {
            endpoint
        } else {
            protocol.open_publisher(&endpoint).await?
        };
        Ok(Self::new(service, endpoint, through_broker, protocol))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Where events are published (the bound endpoint once bound).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Publish `payload` as `<service>:<topic>`.
    pub async fn dispatch(&self, topic: &str, payload: impl Serialize) -> Result<()> {
        let key = EventKey::new(self.service.as_str(), topic);
        let payload = serde_json::to_value(payload)?;
        self.protocol
            .dispatch(&self.endpoint, &key.to_string(), &payload, self.through_broker)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::Counter;
    use serde_json::json;

    #[test]
    fn test_event_key_parse() {
        assert_eq!(EventKey::parse("math:sum"), Some(EventKey::new("math", "sum")));
        assert_eq!(
            EventKey::parse("math:sum:total"),
            Some(EventKey::new("math", "sum:total"))
        );
        assert_eq!(EventKey::parse("nocolon"), None);
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry: EventRegistry<Counter> = EventRegistry::new();
        assert!(registry.register("math", "sum", |_, _| async { Ok(()) }));
        assert!(!registry.register("math", "sum", |_, _| async { Ok(()) }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_topics_for_publisher() {
        let mut registry: EventRegistry<Counter> = EventRegistry::new();
        registry.register("math", "sum", |_, _| async { Ok(()) });
        registry.register("math", "div", |_, _| async { Ok(()) });
        registry.register("users", "created", |_, _| async { Ok(()) });

        assert_eq!(registry.topics_for("math"), vec!["math:div", "math:sum"]);
        assert!(registry.topics_for("billing").is_empty());
    }

    #[tokio::test]
    async fn test_handler_receives_service_and_payload() {
        let mut registry: EventRegistry<Counter> = EventRegistry::new();
        registry.register("math", "sum", |svc: Arc<Counter>, payload: Value| async move {
            svc.add(payload.as_i64().unwrap_or_default());
            Ok(())
        });

        let service = Arc::new(Counter::default());
        let handler = registry.get(&EventKey::new("math", "sum")).unwrap();
        handler(service.clone(), json!(3)).await.unwrap();
        assert_eq!(service.value(), 3);
    }

    #[tokio::test]
    async fn test_dispatcher_publishes_prefixed_topic() {
        let protocol = Arc::new(Protocol::json());
        let dispatcher = EventDispatcher::bind(
            "math",
            Endpoint::inproc("events-test", 0),
            false,
            protocol.clone(),
        )
        .await
        .unwrap();
        assert_ne!(dispatcher.endpoint().port(), 0);

        let mut subscription = protocol
            .transport()
            .subscribe(dispatcher.endpoint(), &["math:sum".to_string()])
            .await
            .unwrap();

        dispatcher.dispatch("sum", 3).await.unwrap();
        let (topic, payload) = subscription.recv().await.unwrap();
        assert_eq!(topic, "math:sum");
        assert_eq!(protocol.parse_event(&payload).unwrap(), json!(3));
    }
}
