//! In-process endpoints.
//!
//! Every `inproc://host:port` name lives in one process-wide table so that a
//! container and a proxy built with separate transports still find each other.
//! Connecting hands the listener one end of a `tokio::io::duplex` pipe.

use super::{Connection, Endpoint, Listener};
use crate::config::TransportConfig;
use crate::{Result, ZerolinkError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// Pending connections queued per in-process listener.
const ACCEPT_BACKLOG: usize = 128;

/// First port handed out for `inproc` binds on port 0.
const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Default)]
pub(crate) struct InprocHub {
    listeners: Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>,
    next_port: AtomicU16,
}

impl InprocHub {
    pub(crate) fn global() -> Arc<InprocHub> {
        static HUB: OnceLock<Arc<InprocHub>> = OnceLock::new();
        HUB.get_or_init(|| {
            Arc::new(InprocHub {
                listeners: Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            })
        })
        .clone()
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<DuplexStream>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn bind(self: &Arc<Self>, endpoint: &Endpoint) -> Result<Listener> {
        let mut listeners = self.listeners();

        let endpoint = if endpoint.port() == 0 {
            loop {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                let candidate = endpoint.with_port(port.max(EPHEMERAL_PORT_START));
                if !listeners.contains_key(&candidate.address()) {
                    break candidate;
                }
            }
        } else {
            endpoint.clone()
        };

        let key = endpoint.address();
        if let Some(existing) = listeners.get(&key) {
            if !existing.is_closed() {
                return Err(ZerolinkError::transport(
                    &endpoint,
                    "address already in use",
                    None,
                ));
            }
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(key.clone(), tx);

        let binding = Binding {
            hub: Arc::clone(self),
            key,
        };
        Ok(Listener::inproc(endpoint, rx, binding))
    }

    pub(crate) async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        let sender = self.listeners().get(&endpoint.address()).cloned();
        let sender = sender.ok_or_else(|| {
            ZerolinkError::transport(endpoint, "no listener bound", None)
        })?;

        let (local, remote) = tokio::io::duplex(TransportConfig::INPROC_BUFFER_SIZE);
        sender
            .send(remote)
            .await
            .map_err(|_| ZerolinkError::transport(endpoint, "listener closed", None))?;

        Ok(Connection::new(endpoint.clone(), local))
    }
}

/// Keeps a name registered; dropping it frees the name.
pub(crate) struct Binding {
    hub: Arc<InprocHub>,
    key: String,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.hub.listeners().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reaches_bound_listener() {
        let hub = InprocHub::global();
        let endpoint = Endpoint::inproc("inproc-hub-test", 1);
        let mut listener = hub.bind(&endpoint).unwrap();

        let mut client = hub.connect(&endpoint).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.send_frame(b"hello").await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_double_bind_is_rejected_until_dropped() {
        let hub = InprocHub::global();
        let endpoint = Endpoint::inproc("inproc-hub-test", 2);

        let listener = hub.bind(&endpoint).unwrap();
        assert!(hub.bind(&endpoint).is_err());

        drop(listener);
        assert!(hub.bind(&endpoint).is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_retryable() {
        let hub = InprocHub::global();
        let err = hub
            .connect(&Endpoint::inproc("inproc-hub-test", 3))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_port_zero_gets_a_fresh_port() {
        let hub = InprocHub::global();
        let first = hub.bind(&Endpoint::inproc("inproc-hub-test", 0)).unwrap();
        let second = hub.bind(&Endpoint::inproc("inproc-hub-test", 0)).unwrap();

        assert_ne!(first.local_endpoint().port(), 0);
        assert_ne!(first.local_endpoint(), second.local_endpoint());
    }
}
