//! Default [`Transport`] over TCP sockets and in-process pipes.

use super::inproc::InprocHub;
use super::pubsub::{Enqueued, FrameQueue, TopicMessage};
use super::{Connection, Endpoint, Listener, PublishHub, Subscription, Transport};
use crate::config::{Scheme, TransportConfig};
use crate::{Result, ZerolinkError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[derive(Clone)]
enum Publisher {
    /// This process bound the endpoint and is the origin of its events.
    Origin(Arc<PublishHub>),
    /// Connected outward to a broker frontend.
    Relay(FrameQueue),
}

/// Socket transport for `tcp://` and `inproc://` endpoints.
///
/// A request checks an idle connection out of the per-endpoint pool (or opens
/// one) and returns it only after a complete reply, so a cancelled call never
/// leaves a stray reply behind for the next caller. Keeps one publisher per
/// dispatch endpoint.
pub struct SocketTransport {
    inproc: Arc<InprocHub>,
    idle_requests: Mutex<HashMap<String, Vec<Connection>>>,
    publishers: tokio::sync::Mutex<HashMap<String, Publisher>>,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self {
            inproc: InprocHub::global(),
            idle_requests: Mutex::new(HashMap::new()),
            publishers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn idle_requests(&self) -> MutexGuard<'_, HashMap<String, Vec<Connection>>> {
        self.idle_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn checkout_request_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let idle = self
            .idle_requests()
            .get_mut(&endpoint.to_string())
            .and_then(|pool| pool.pop());
        match idle {
            Some(connection) => Ok(connection),
            None => self.connect(endpoint).await,
        }
    }

    fn checkin_request_connection(&self, endpoint: &Endpoint, connection: Connection) {
        let mut idle = self.idle_requests();
        let pool = idle.entry(endpoint.to_string()).or_default();
        if pool.len() < TransportConfig::MAX_IDLE_REQUEST_CONNECTIONS {
            pool.push(connection);
        }
    }

    async fn bind_hub(&self, endpoint: &Endpoint) -> Result<Arc<PublishHub>> {
        let listener = self.bind(endpoint).await?;
        Ok(Arc::new(PublishHub::start(listener)))
    }

    /// The publisher for `endpoint`, created on first use.
    async fn publisher(&self, endpoint: &Endpoint, through_broker: bool) -> Result<Publisher> {
        let key = endpoint.to_string();
        let mut publishers = self.publishers.lock().await;

        if let Some(existing) = publishers.get(&key) {
            return Ok(existing.clone());
        }
        let publisher = if through_broker {
            Publisher::Relay(FrameQueue::spawn(self.connect(endpoint).await?, None))
        } else {
            Publisher::Origin(self.bind_hub(endpoint).await?)
        };
        publishers.insert(key, publisher.clone());
        Ok(publisher)
    }

    /// Forget a relay whose writer died so the next dispatch reconnects.
    async fn forget_relay(&self, endpoint: &Endpoint, queue: &FrameQueue) {
        let key = endpoint.to_string();
        let mut publishers = self.publishers.lock().await;
        if let Some(Publisher::Relay(cached)) = publishers.get(&key) {
            if cached.same_queue(queue) {
                publishers.remove(&key);
            }
        }
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn request(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<Vec<u8>> {
        // Owned for the whole round trip: if this future is dropped mid-call the
        // connection goes with it instead of back into the pool.
        let mut connection = self.checkout_request_connection(endpoint).await?;
        connection.send_frame(payload).await?;
        let reply = connection.recv_frame().await?;
        self.checkin_request_connection(endpoint, connection);
        Ok(reply)
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &[u8],
        connection: Option<Connection>,
    ) -> Result<Connection> {
        let mut connection = match connection {
            Some(connection) => connection,
            None => self.connect(endpoint).await?,
        };
        connection.send_frame(payload).await?;
        Ok(connection)
    }

    async fn receive(&self, connection: &mut Connection) -> Result<Vec<u8>> {
        connection.recv_frame().await
    }

    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        through_broker: bool,
    ) -> Result<()> {
        match self.publisher(endpoint, through_broker).await? {
            Publisher::Origin(hub) => {
                let queued = hub.publish(topic, payload).await;
                debug!("Published {} to {} subscriber(s)", topic, queued);
                Ok(())
            }
            Publisher::Relay(queue) => match queue.push(TopicMessage::new(topic, payload)) {
                Enqueued::Queued => Ok(()),
                Enqueued::Dropped => {
                    debug!("Relay queue to {} full, dropped {}", endpoint, topic);
                    Ok(())
                }
                Enqueued::Closed => {
                    // A broken relay is reopened on the next dispatch.
                    self.forget_relay(endpoint, &queue).await;
                    Err(ZerolinkError::ConnectionClosed {
                        endpoint: endpoint.to_string(),
                    })
                }
            },
        }
    }

    async fn open_publisher(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let key = endpoint.to_string();
        let mut publishers = self.publishers.lock().await;

        match publishers.get(&key) {
            Some(Publisher::Origin(hub)) => return Ok(hub.endpoint().clone()),
            Some(Publisher::Relay(_)) => {
                return Err(ZerolinkError::transport(
                    endpoint,
                    "endpoint is already used to relay through a broker",
                    None,
                ))
            }
            None => {}
        }

        let hub = self.bind_hub(endpoint).await?;
        let bound = hub.endpoint().clone();
        if bound != *endpoint {
            publishers.insert(bound.to_string(), Publisher::Origin(hub.clone()));
        }
        publishers.insert(key, Publisher::Origin(hub));
        Ok(bound)
    }

    async fn bind(&self, endpoint: &Endpoint) -> Result<Listener> {
        match endpoint.scheme() {
            Scheme::Tcp => {
                let listener = TcpListener::bind(endpoint.bind_address())
                    .await
                    .map_err(|e| ZerolinkError::transport(endpoint, "bind failed", Some(e)))?;
                let port = listener.local_addr()?.port();
                Ok(Listener::tcp(endpoint.with_port(port), listener))
            }
            Scheme::Inproc => self.inproc.bind(endpoint),
        }
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        match endpoint.scheme() {
            Scheme::Tcp => {
                let stream = TcpStream::connect(endpoint.connect_address())
                    .await
                    .map_err(|e| ZerolinkError::transport(endpoint, "connect failed", Some(e)))?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::new(endpoint.clone(), stream))
            }
            Scheme::Inproc => self.inproc.connect(endpoint).await,
        }
    }

    async fn subscribe(&self, endpoint: &Endpoint, topics: &[String]) -> Result<Subscription> {
        let connection = self.connect(endpoint).await?;
        Subscription::establish(connection, topics).await
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport").finish_non_exhaustive()
    }
}
