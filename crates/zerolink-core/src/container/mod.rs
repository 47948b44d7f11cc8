//! Service containers.
//!
//! A [`Container`] owns one service instance, binds its reply endpoint,
//! dispatches incoming calls to registered methods and, when configured,
//! subscribes to the events its handlers consume.
//!
//! # Lifecycle
//!
//! `init` creates the service, `run` serves until `stop` is called. A container
//! that was never run, or that was already stopped, refuses `stop` with
//! [`ZerolinkError::ContainerNotRunning`].
//!
//! Failures inside a called method are sent back to the caller and never end
//! `run`. A failing event handler does: `run` returns the error so a
//! [`ContainerRunner`] can restart the container.

mod runner;
mod server;

pub use runner::{ContainerRunner, Runnable};
pub use server::{CallCallback, EventCallback, EventServer, RpcServer, ServerControl};

use crate::config::RunConfig;
use crate::events::{EventKey, EventRegistry};
use crate::marshal::{ErrorHandler, Fault, RemoteErrorHandler, ServiceError};
use crate::protocol::{Protocol, RpcResponse};
use crate::registry::{CallArgs, MethodKey, MethodRegistry};
use crate::service::{Service, ServiceContext};
use crate::transport::Endpoint;
use crate::validation::{validate_or_ignore, ValidationHook};
use crate::{Result, ZerolinkError};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

struct ContainerState<S> {
    service: Option<Arc<S>>,
    rpc: Option<ServerControl>,
    events: Vec<ServerControl>,
    subscriptions: Vec<watch::Receiver<bool>>,
}

/// Hosts one service of type `S`.
pub struct Container<S: Service> {
    methods: Arc<MethodRegistry<S>>,
    events: Arc<EventRegistry<S>>,
    error_handler: Arc<dyn ErrorHandler>,
    validator: ValidationHook,
    protocol: Arc<Protocol>,
    settings: Arc<Value>,
    state: Mutex<ContainerState<S>>,
    ready_tx: watch::Sender<Option<Endpoint>>,
}

impl<S: Service> Container<S> {
    pub fn new(methods: MethodRegistry<S>) -> Self {
        let (ready_tx, _) = watch::channel(None);
        Self {
            methods: Arc::new(methods),
            events: Arc::new(EventRegistry::new()),
            error_handler: Arc::new(RemoteErrorHandler::new()),
            validator: validate_or_ignore,
            protocol: Arc::new(Protocol::json()),
            settings: Arc::new(Value::Null),
            state: Mutex::new(ContainerState {
                service: None,
                rpc: None,
                events: Vec::new(),
                subscriptions: Vec::new(),
            }),
            ready_tx,
        }
    }

    pub fn with_events(mut self, events: EventRegistry<S>) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_validator(mut self, validator: ValidationHook) -> Self {
        self.validator = validator;
        self
    }

    /// Settings handed to the service through its [`ServiceContext`].
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    /// Protocol handed to the service and used for serving, unless the
    /// service brings its own.
    pub fn with_protocol(mut self, protocol: Arc<Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    fn state(&self) -> MutexGuard<'_, ContainerState<S>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current service instance, once initialized.
    pub fn service(&self) -> Option<Arc<S>> {
        self.state().service.clone()
    }

    /// Whether a reply loop is currently live.
    pub fn is_running(&self) -> bool {
        self.state().rpc.is_some()
    }

    /// Create a fresh service instance, replacing any previous one.
    pub async fn init(&self) -> Result<Arc<S>> {
        let ctx = ServiceContext::new(self.protocol.clone()).with_settings(self.settings.clone());
        let service = Arc::new(S::init(&ctx).await?);
        self.state().service = Some(service.clone());
        debug!("Initialized service {} ({})", service.name(), S::CLASS);
        Ok(service)
    }

    fn protocol_for(&self, service: &S) -> Arc<Protocol> {
        service.protocol().unwrap_or_else(|| self.protocol.clone())
    }

    /// Initialize, subscribe when an event endpoint is configured, then serve
    /// calls until stopped.
    pub async fn run(&self, config: &RunConfig) -> Result<()> {
        self.ready_tx.send_replace(None);

        let service = self.init().await?;
        let protocol = self.protocol_for(&service);

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        if let Some(event_endpoint) = config.event_endpoint() {
            self.subscribe_with(&event_endpoint, failure_tx).await?;
        }

        let server = RpcServer::bind(
            protocol.transport().as_ref(),
            &config.rpc_endpoint(),
            config.workers,
        )
        .await?;
        let control = server.control();
        let bound = server.local_endpoint().clone();
        self.state().rpc = Some(control.clone());

        let dispatcher = Arc::new(CallDispatcher {
            service,
            methods: self.methods.clone(),
            events: self.events.clone(),
            error_handler: self.error_handler.clone(),
            validator: self.validator,
            protocol,
        });
        let callback: CallCallback = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |data| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.handle_call(&data).await })
            })
        };

        info!("Container {} serving on {}", S::CLASS, bound);
        self.ready_tx.send_replace(Some(bound));

        let result = tokio::select! {
            result = server.run(callback) => result,
            Some(failure) = failure_rx.recv() => {
                warn!("Container {} event worker failed: {}", S::CLASS, failure);
                Err(failure)
            }
        };

        let mut state = self.state();
        state.rpc = None;
        for events in state.events.drain(..) {
            events.stop();
        }
        state.subscriptions.clear();
        drop(state);
        control.stop();

        result
    }

    /// Stop the reply loop and every subscribe loop.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state();
        if state.service.is_none() {
            return Err(ZerolinkError::ContainerNotRunning);
        }
        let rpc = state.rpc.take().ok_or(ZerolinkError::ContainerNotRunning)?;

        rpc.stop();
        for events in state.events.drain(..) {
            events.stop();
        }
        state.subscriptions.clear();

        info!("Container {} stopped", S::CLASS);
        Ok(())
    }

    /// Subscribe to the events of every proxied service that publishes and has
    /// at least one registered handler here.
    ///
    /// Handler failures are logged and stop the affected subscribe loop; when
    /// subscribed from `run` they end `run` instead.
    pub async fn subscribe(&self, endpoint: &Endpoint) -> Result<()> {
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        self.subscribe_with(endpoint, failure_tx).await?;
        tokio::spawn(async move {
            while let Some(failure) = failure_rx.recv().await {
                warn!("Event worker failed: {}", failure);
            }
        });
        Ok(())
    }

    async fn subscribe_with(
        &self,
        endpoint: &Endpoint,
        failures: mpsc::UnboundedSender<ZerolinkError>,
    ) -> Result<()> {
        let service = self.service().ok_or(ZerolinkError::ServiceNotInitialized)?;
        let protocol = self.protocol_for(&service);

        let publishers: BTreeSet<String> = service
            .proxies()
            .into_iter()
            .filter(|proxy| proxy.event_endpoint().is_some())
            .map(|proxy| proxy.name().to_string())
            .collect();

        let dispatcher = Arc::new(CallDispatcher {
            service: service.clone(),
            methods: self.methods.clone(),
            events: self.events.clone(),
            error_handler: self.error_handler.clone(),
            validator: self.validator,
            protocol: protocol.clone(),
        });

        for publisher in publishers {
            let topics = self.events.topics_for(&publisher);
            if topics.is_empty() {
                debug!("No handlers for events of {}, not subscribing", publisher);
                continue;
            }

            let server = EventServer::new(protocol.transport().clone(), endpoint.clone(), topics);
            {
                let mut state = self.state();
                state.events.push(server.control());
                state.subscriptions.push(server.connected());
            }

            let callback: EventCallback = {
                let dispatcher = dispatcher.clone();
                Arc::new(move |topic, payload| {
                    let dispatcher = dispatcher.clone();
                    Box::pin(async move { dispatcher.handle_event(&topic, &payload).await })
                })
            };
            let failures = failures.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(callback).await {
                    let _ = failures.send(e);
                }
            });
        }

        Ok(())
    }

    /// Resolves with the bound reply endpoint once `run` is serving.
    pub async fn ready(&self) -> Result<Endpoint> {
        let mut rx = self.ready_tx.subscribe();
        let ready = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ZerolinkError::ContainerNotRunning)?;
        ready.clone().ok_or(ZerolinkError::ContainerNotRunning)
    }

    /// Resolves once `run` is serving and every subscription is connected.
    pub async fn subscribed(&self) -> Result<()> {
        self.ready().await?;
        let subscriptions = self.state().subscriptions.clone();
        for mut connected in subscriptions {
            connected
                .wait_for(|connected| *connected)
                .await
                .map_err(|_| ZerolinkError::ContainerNotRunning)?;
        }
        Ok(())
    }
}

impl<S: Service> std::fmt::Debug for Container<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("service", &S::CLASS)
            .field("methods", &self.methods)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: Service> Runnable for Container<S> {
    async fn run(&self, config: &RunConfig) -> Result<()> {
        Container::run(self, config).await
    }

    async fn stop(&self) -> Result<()> {
        Container::stop(self).await
    }

    fn type_name(&self) -> &str {
        S::CLASS
    }
}

/// Everything needed to serve calls and events for one service instance.
struct CallDispatcher<S: Service> {
    service: Arc<S>,
    methods: Arc<MethodRegistry<S>>,
    events: Arc<EventRegistry<S>>,
    error_handler: Arc<dyn ErrorHandler>,
    validator: ValidationHook,
    protocol: Arc<Protocol>,
}

impl<S: Service> CallDispatcher<S> {
    /// Reply bytes for one request, or `None` for anything that must stay
    /// unanswered (unregistered method, unreadable request).
    async fn handle_call(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request = match self.protocol.parse_call(data) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping unreadable request: {}", e);
                return None;
            }
        };

        let key = MethodKey::new(S::CLASS, request.method.as_str());
        let Some(entry) = self.methods.lookup(&key) else {
            debug!("Method {} is not registered, no reply", key);
            return None;
        };

        let call = CallArgs::from(request);
        let outcome = match (self.validator)(entry.params.as_deref(), &call) {
            Ok(()) => AssertUnwindSafe((entry.handler)(self.service.clone(), call))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ServiceError::panic(panic_message(&*panic)).into())),
            Err(fault) => Err(fault),
        };

        let response = match outcome {
            Ok(result) => RpcResponse::ok(result),
            Err(fault) => {
                debug!("Method {} failed: {}", key, fault);
                RpcResponse::error(self.error_handler.handle_fault(&fault))
            }
        };

        match self.protocol.build_response(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                let fault = Fault::from(ServiceError::runtime(format!(
                    "Result of {} cannot be serialized: {}",
                    key, e
                )));
                self.protocol
                    .build_response(&RpcResponse::error(self.error_handler.handle_fault(&fault)))
                    .ok()
            }
        }
    }

    /// Run the handler registered for `topic`; unknown topics are ignored.
    async fn handle_event(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let Some(key) = EventKey::parse(topic) else {
            warn!("Ignoring event with malformed topic {}", topic);
            return Ok(());
        };

        let payload = self.protocol.parse_event(payload)?;

        let Some(handler) = self.events.get(&key) else {
            return Ok(());
        };

        match AssertUnwindSafe(handler(self.service.clone(), payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(server::event_failure(topic, fault.to_string())),
            Err(panic) => Err(server::event_failure(topic, panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
