//! Topic publishing over framed connections.
//!
//! Handshake: a subscriber sends its topic filters as a JSON array in the first
//! frame and the publisher acknowledges with an empty frame. After that the
//! publisher writes `(topic, payload)` frame pairs for every topic starting with
//! one of the filters.
//!
//! Delivery is best-effort. Every subscriber sits behind a bounded queue drained
//! by its own writer task, so publishing never waits on a peer: a subscriber
//! that falls behind misses messages while its queue is full, a subscriber
//! whose connection fails is dropped and late subscribers miss earlier messages.

use super::{Connection, Endpoint, Listener};
use crate::config::TransportConfig;
use crate::{Result, ZerolinkError};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One topic message, shared by every queue it is fanned out to.
#[derive(Debug, Clone)]
pub(crate) struct TopicMessage {
    topic: Arc<str>,
    payload: Arc<[u8]>,
}

impl TopicMessage {
    pub(crate) fn new(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: Arc::from(topic),
            payload: Arc::from(payload),
        }
    }
}

/// Outcome of [`FrameQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The queue was full; the message was dropped.
    Dropped,
    /// The writer task is gone because its connection failed.
    Closed,
}

/// Bounded queue of topic messages in front of one connection.
#[derive(Debug, Clone)]
pub(crate) struct FrameQueue {
    tx: mpsc::Sender<TopicMessage>,
}

impl FrameQueue {
    /// Spawn the writer task for `connection`. `preamble` is written before
    /// any queued message.
    pub(crate) fn spawn(connection: Connection, preamble: Option<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel(TransportConfig::PUBLISH_QUEUE_CAPACITY);
        tokio::spawn(Self::drain(connection, preamble, rx));
        Self { tx }
    }

    pub(crate) fn push(&self, message: TopicMessage) -> Enqueued {
        match self.tx.try_send(message) {
            Ok(()) => Enqueued::Queued,
            Err(TrySendError::Full(_)) => Enqueued::Dropped,
            Err(TrySendError::Closed(_)) => Enqueued::Closed,
        }
    }

    pub(crate) fn same_queue(&self, other: &FrameQueue) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn drain(
        mut connection: Connection,
        preamble: Option<Vec<u8>>,
        mut rx: mpsc::Receiver<TopicMessage>,
    ) {
        if let Some(frame) = preamble {
            if let Err(e) = connection.send_frame(&frame).await {
                debug!("Subscriber on {} left before the ack: {}", connection.endpoint(), e);
                return;
            }
        }

        while let Some(message) = rx.recv().await {
            let sent = match connection.send_frame(message.topic.as_bytes()).await {
                Ok(()) => connection.send_frame(&message.payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!("Closing topic writer for {}: {}", connection.endpoint(), e);
                return;
            }
        }
    }
}

struct SubscriberSlot {
    filters: Vec<String>,
    queue: FrameQueue,
}

impl SubscriberSlot {
    fn accepts(&self, topic: &str) -> bool {
        self.filters.iter().any(|filter| topic.starts_with(filter.as_str()))
    }
}

/// A bound publisher endpoint fanning topic messages out to subscribers.
///
/// Dropping the hub stops accepting subscribers. Existing subscribers are
/// closed once their queues are drained.
pub struct PublishHub {
    endpoint: Endpoint,
    subscribers: Arc<Mutex<Vec<SubscriberSlot>>>,
    accept_task: JoinHandle<()>,
}

impl PublishHub {
    /// Start accepting subscribers on an already bound listener.
    pub fn start(listener: Listener) -> Self {
        let endpoint = listener.local_endpoint().clone();
        let subscribers = Arc::new(Mutex::new(Vec::new()));

        debug!("Publisher bound on {}", endpoint);

        let accept_task = tokio::spawn(Self::accept_loop(listener, subscribers.clone()));

        Self {
            endpoint,
            subscribers,
            accept_task,
        }
    }

    /// The bound endpoint subscribers connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of currently connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Queue one topic message for every matching subscriber.
    ///
    /// Never waits on a subscriber. Returns how many queues took the message.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let message = TopicMessage::new(topic, payload);
        let mut subscribers = self.subscribers.lock().await;
        let mut queued = 0;

        subscribers.retain(|slot| {
            if !slot.accepts(topic) {
                return true;
            }
            match slot.queue.push(message.clone()) {
                Enqueued::Queued => {
                    queued += 1;
                    true
                }
                Enqueued::Dropped => {
                    debug!("Subscriber queue full on {}, dropped {}", self.endpoint, topic);
                    true
                }
                Enqueued::Closed => {
                    debug!("Dropping closed subscriber on {}", self.endpoint);
                    false
                }
            }
        });

        queued
    }

    async fn accept_loop(mut listener: Listener, subscribers: Arc<Mutex<Vec<SubscriberSlot>>>) {
        loop {
            let connection = match listener.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Publisher accept error: {}", e);
                    continue;
                }
            };
            tokio::spawn(Self::register(connection, subscribers.clone()));
        }
    }

    async fn register(mut connection: Connection, subscribers: Arc<Mutex<Vec<SubscriberSlot>>>) {
        let first = tokio::time::timeout(
            TransportConfig::SUBSCRIBE_HANDSHAKE_TIMEOUT,
            connection.recv_frame(),
        )
        .await;

        let filters: Vec<String> = match first {
            Ok(Ok(frame)) => match serde_json::from_slice(&frame) {
                Ok(filters) => filters,
                Err(e) => {
                    debug!("Rejecting subscriber with malformed filters: {}", e);
                    return;
                }
            },
            Ok(Err(e)) => {
                debug!("Subscriber left before handshake: {}", e);
                return;
            }
            Err(_) => {
                debug!("Subscriber handshake timed out");
                return;
            }
        };

        // The ack is the first frame of the queue and the writer only starts
        // under the lock, so no publish slips in between ack and registration.
        let mut subscribers = subscribers.lock().await;
        debug!("Subscriber registered for {:?}", filters);
        let queue = FrameQueue::spawn(connection, Some(Vec::new()));
        subscribers.push(SubscriberSlot { filters, queue });
    }
}

impl Drop for PublishHub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for PublishHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHub")
            .field("endpoint", &self.endpoint.to_string())
            .finish_non_exhaustive()
    }
}

/// The receiving side of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topics: Vec<String>,
    connection: Connection,
}

impl Subscription {
    /// Announce `topics` on a fresh connection and wait for the acknowledgement.
    pub async fn establish(mut connection: Connection, topics: &[String]) -> Result<Self> {
        let endpoint = connection.endpoint().clone();
        let filters = serde_json::to_vec(topics)?;
        connection.send_frame(&filters).await?;

        let ack = tokio::time::timeout(
            TransportConfig::SUBSCRIBE_HANDSHAKE_TIMEOUT,
            connection.recv_frame(),
        )
        .await
        .map_err(|_| ZerolinkError::transport(&endpoint, "subscribe handshake timed out", None))??;

        if !ack.is_empty() {
            return Err(ZerolinkError::transport(
                &endpoint,
                "unexpected subscribe acknowledgement",
                None,
            ));
        }

        Ok(Self {
            topics: topics.to_vec(),
            connection,
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.connection.endpoint()
    }

    /// Wait for the next `(topic, payload)` message.
    pub async fn recv(&mut self) -> Result<(String, Vec<u8>)> {
        let topic = self.connection.recv_frame().await?;
        let payload = self.connection.recv_frame().await?;
        let topic = String::from_utf8(topic).map_err(|_| ZerolinkError::Envelope {
            message: "Topic is not valid UTF-8".to_string(),
        })?;
        Ok((topic, payload))
    }
}
