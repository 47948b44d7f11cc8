//! Single-hop event relay.
//!
//! Publishers that dispatch with `through_broker` connect to the broker's
//! frontend and stream `(topic, payload)` frame pairs into it. Subscribers
//! connect to the backend exactly as they would to a publisher.

use super::{Connection, Endpoint, PublishHub, Transport};
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running broker. Dropping it stops the relay.
pub struct Broker {
    frontend: Endpoint,
    hub: Arc<PublishHub>,
    relay_task: JoinHandle<()>,
}

impl Broker {
    /// Bind both sides and start relaying.
    pub async fn start(
        transport: &dyn Transport,
        frontend: &Endpoint,
        backend: &Endpoint,
    ) -> Result<Self> {
        let mut listener = transport.bind(frontend).await?;
        let frontend = listener.local_endpoint().clone();
        let hub = Arc::new(PublishHub::start(transport.bind(backend).await?));

        info!("Broker relaying {} -> {}", frontend, hub.endpoint());

        let relay_hub = hub.clone();
        let relay_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(connection) => {
                        tokio::spawn(Self::relay(connection, relay_hub.clone()));
                    }
                    Err(e) => warn!("Broker accept error: {}", e),
                }
            }
        });

        Ok(Self {
            frontend,
            hub,
            relay_task,
        })
    }

    /// Endpoint publishers connect to.
    pub fn frontend(&self) -> &Endpoint {
        &self.frontend
    }

    /// Endpoint subscribers connect to.
    pub fn backend(&self) -> &Endpoint {
        self.hub.endpoint()
    }

    async fn relay(mut connection: Connection, hub: Arc<PublishHub>) {
        loop {
            let topic = match connection.try_recv_frame().await {
                Ok(Some(topic)) => topic,
                Ok(None) => break,
                Err(e) => {
                    debug!("Broker publisher connection failed: {}", e);
                    break;
                }
            };
            let payload = match connection.recv_frame().await {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("Broker publisher sent a topic without payload: {}", e);
                    break;
                }
            };
            match std::str::from_utf8(&topic) {
                Ok(topic) => {
                    hub.publish(topic, &payload).await;
                }
                Err(_) => warn!("Broker dropped a message with a non UTF-8 topic"),
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.relay_task.abort();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("frontend", &self.frontend.to_string())
            .field("backend", &self.hub.endpoint().to_string())
            .finish()
    }
}
