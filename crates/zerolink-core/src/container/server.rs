//! Reply and subscribe loops run by a container.
//!
//! Both loops stop cooperatively through a [`ServerControl`]: a pending receive
//! is raced against the stop signal, so stopping never waits for the next
//! message.

use crate::config::TransportConfig;
use crate::transport::{Connection, Endpoint, Listener, Transport};
use crate::{Result, ZerolinkError};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Produces the reply to one request frame; `None` sends nothing back.
pub type CallCallback = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

/// Handles one `(topic, payload)` message; an error ends the subscribe loop.
pub type EventCallback = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Stop switch shared between a server and whoever owns it.
#[derive(Debug, Clone)]
pub struct ServerControl {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ServerControl {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Request/reply loop on a bound endpoint.
pub struct RpcServer {
    listener: Listener,
    workers: usize,
    control: ServerControl,
}

impl RpcServer {
    /// Bind `endpoint`. At most `workers` requests are dispatched at once.
    pub async fn bind(transport: &dyn Transport, endpoint: &Endpoint, workers: usize) -> Result<Self> {
        let listener = transport.bind(endpoint).await?;
        Ok(Self {
            listener,
            workers: workers.max(1),
            control: ServerControl::new(),
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        self.listener.local_endpoint()
    }

    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// Serve until stopped. Each connection is read in order: one request,
    /// then its reply (if any), then the next request.
    pub async fn run(mut self, callback: CallCallback) -> Result<()> {
        let endpoint = self.listener.local_endpoint().clone();
        // Shared by all connections; see `RunConfig::workers`.
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut connections = JoinSet::new();

        info!("Starting RPC server on {}", endpoint);

        loop {
            tokio::select! {
                _ = self.control.stopped() => {
                    info!("RPC server on {} shutting down", endpoint);
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok(connection) => {
                            debug!("RPC connection from {}", connection.endpoint());
                            connections.spawn(Self::serve_connection(
                                connection,
                                callback.clone(),
                                permits.clone(),
                                self.control.clone(),
                            ));
                        }
                        Err(e) => error!("RPC accept error on {}: {}", endpoint, e),
                    }
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }

    async fn serve_connection(
        mut connection: Connection,
        callback: CallCallback,
        permits: Arc<Semaphore>,
        control: ServerControl,
    ) {
        loop {
            let frame = tokio::select! {
                _ = control.stopped() => return,
                frame = connection.try_recv_frame() => frame,
            };

            let request = match frame {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    debug!("RPC connection {} ended: {}", connection.endpoint(), e);
                    return;
                }
            };

            let reply = {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                callback(request).await
            };

            if let Some(reply) = reply {
                if let Err(e) = connection.send_frame(&reply).await {
                    debug!("RPC reply to {} failed: {}", connection.endpoint(), e);
                    return;
                }
            }
        }
    }
}

/// Subscribe loop: connects (retrying until the publisher exists) and feeds
/// every received message to the callback.
pub struct EventServer {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    topics: Vec<String>,
    control: ServerControl,
    connected_tx: watch::Sender<bool>,
}

impl EventServer {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, topics: Vec<String>) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            transport,
            endpoint,
            topics,
            control: ServerControl::new(),
            connected_tx,
        }
    }

    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// `true` while the subscription handshake has completed.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Run until stopped or until the callback fails.
    ///
    /// A lost publisher is reconnected to; only callback errors end the loop
    /// with an error.
    pub async fn run(self, callback: EventCallback) -> Result<()> {
        info!("Subscribing to {:?} on {}", self.topics, self.endpoint);

        loop {
            let Some(mut subscription) = self.connect().await? else {
                return Ok(());
            };
            self.connected_tx.send_replace(true);

            loop {
                let message = tokio::select! {
                    _ = self.control.stopped() => return Ok(()),
                    message = subscription.recv() => message,
                };

                match message {
                    Ok((topic, payload)) => callback(topic, payload).await?,
                    Err(e) if e.is_retryable() => {
                        debug!("Subscription to {} lost: {}", self.endpoint, e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            self.connected_tx.send_replace(false);
        }
    }

    /// `None` when stopped before a subscription could be made.
    async fn connect(&self) -> Result<Option<crate::transport::Subscription>> {
        loop {
            let attempt = tokio::select! {
                _ = self.control.stopped() => return Ok(None),
                attempt = self.transport.subscribe(&self.endpoint, &self.topics) => attempt,
            };

            match attempt {
                Ok(subscription) => return Ok(Some(subscription)),
                Err(e) if e.is_retryable() => {
                    debug!("Publisher {} not reachable yet: {}", self.endpoint, e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = self.control.stopped() => return Ok(None),
                _ = tokio::time::sleep(TransportConfig::SUBSCRIBE_RETRY_INTERVAL) => {}
            }
        }
    }
}

impl std::fmt::Debug for EventServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServer")
            .field("endpoint", &self.endpoint.to_string())
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Error for a handler failure on `topic`.
pub(crate) fn event_failure(topic: &str, message: impl Into<String>) -> ZerolinkError {
    ZerolinkError::EventHandler {
        topic: topic.to_string(),
        message: message.into(),
    }
}
