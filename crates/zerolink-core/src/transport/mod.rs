//! Byte transfer between containers, proxies and publishers.
//!
//! A [`Transport`] moves opaque frames. It knows nothing about envelopes; the
//! [`Protocol`](crate::Protocol) serializes before handing bytes over.
//!
//! Two patterns are supported on top of a framed stream ([`Connection`]):
//!
//! - request/reply: one request frame, then exactly one reply frame
//! - publish/subscribe: a subscriber announces its topic filters, then receives
//!   `(topic, payload)` frame pairs whose topic starts with one of its filters

mod broker;
pub mod frame;
mod inproc;
mod pubsub;
mod socket;

pub use broker::Broker;
pub use pubsub::{PublishHub, Subscription};
pub use socket::SocketTransport;

use crate::config::Scheme;
use crate::{Result, ZerolinkError};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Address of a socket: scheme, host and port.
///
/// For `inproc` the host and port only form a name inside the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Tcp, host, port)
    }

    pub fn inproc(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Inproc, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same endpoint on another port (used once a port-0 bind is resolved).
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            scheme: self.scheme,
            host: self.host.clone(),
            port,
        }
    }

    /// `host:port`, the key of an endpoint within its scheme.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address to bind; `*` means every interface.
    pub(crate) fn bind_address(&self) -> String {
        match self.host.as_str() {
            "*" => format!("0.0.0.0:{}", self.port),
            _ => self.address(),
        }
    }

    /// Address to connect to; a wildcard host is reached over loopback.
    pub(crate) fn connect_address(&self) -> String {
        match self.host.as_str() {
            "*" | "0.0.0.0" => format!("127.0.0.1:{}", self.port),
            _ => self.address(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ZerolinkError;

    /// Parse `scheme://host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ZerolinkError::Config {
            message: format!("Invalid endpoint '{}', expected scheme://host:port", s),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let scheme = Scheme::from_str(scheme).ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(scheme, host, port))
    }
}

/// Any bidirectional byte stream a [`Connection`] can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// An open, framed stream to one endpoint.
///
/// Dropping a connection closes it.
pub struct Connection {
    endpoint: Endpoint,
    stream: Box<dyn IoStream>,
}

impl Connection {
    pub fn new(endpoint: Endpoint, stream: impl IoStream + 'static) -> Self {
        Self {
            endpoint,
            stream: Box::new(stream),
        }
    }

    /// Endpoint this connection was opened against.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        frame::write_frame(&mut self.stream, payload).await
    }

    /// Next frame, or `None` once the peer has closed the stream.
    pub async fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        frame::read_frame(&mut self.stream).await
    }

    /// Next frame; a closed stream is an error.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        self.try_recv_frame()
            .await?
            .ok_or_else(|| ZerolinkError::ConnectionClosed {
                endpoint: self.endpoint.to_string(),
            })
    }

    /// Flush and shut the write half down, then drop the stream.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint.to_string())
            .finish_non_exhaustive()
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    Inproc {
        incoming: mpsc::Receiver<DuplexStream>,
        _binding: inproc::Binding,
    },
}

/// A bound endpoint accepting connections.
pub struct Listener {
    endpoint: Endpoint,
    kind: ListenerKind,
}

impl Listener {
    pub(crate) fn tcp(endpoint: Endpoint, listener: TcpListener) -> Self {
        Self {
            endpoint,
            kind: ListenerKind::Tcp(listener),
        }
    }

    pub(crate) fn inproc(
        endpoint: Endpoint,
        incoming: mpsc::Receiver<DuplexStream>,
        binding: inproc::Binding,
    ) -> Self {
        Self {
            endpoint,
            kind: ListenerKind::Inproc {
                incoming,
                _binding: binding,
            },
        }
    }

    /// The endpoint actually bound (port 0 resolved to the assigned port).
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&mut self) -> Result<Connection> {
        match &mut self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(|e| {
                    ZerolinkError::transport(&self.endpoint, "accept failed", Some(e))
                })?;
                let _ = stream.set_nodelay(true);
                let peer = Endpoint::tcp(peer.ip().to_string(), peer.port());
                Ok(Connection::new(peer, stream))
            }
            ListenerKind::Inproc { incoming, .. } => match incoming.recv().await {
                Some(stream) => Ok(Connection::new(self.endpoint.clone(), stream)),
                None => Err(ZerolinkError::transport(
                    &self.endpoint,
                    "listener closed",
                    None,
                )),
            },
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint.to_string())
            .finish_non_exhaustive()
    }
}

/// Pluggable byte transfer used by [`Protocol`](crate::Protocol).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// One blocking round trip over a reusable request connection.
    async fn request(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<Vec<u8>>;

    /// Send a request frame without waiting for the reply.
    ///
    /// Reuses `connection` when given, otherwise opens a new one. The
    /// connection is returned so the caller can later [`receive`](Self::receive).
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &[u8],
        connection: Option<Connection>,
    ) -> Result<Connection>;

    /// Wait for exactly one reply frame on `connection`.
    async fn receive(&self, connection: &mut Connection) -> Result<Vec<u8>>;

    /// Publish `payload` under `topic`.
    ///
    /// Without a broker the first dispatch to an endpoint binds it (this
    /// process is the origin); with a broker it connects to the broker frontend.
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        through_broker: bool,
    ) -> Result<()>;

    /// Bind the publisher for `endpoint` now instead of on first dispatch.
    async fn open_publisher(&self, endpoint: &Endpoint) -> Result<Endpoint>;

    /// Bind a listening endpoint.
    async fn bind(&self, endpoint: &Endpoint) -> Result<Listener>;

    /// Open a plain framed connection.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection>;

    /// Connect to a publisher (or broker backend) filtered to `topics`.
    async fn subscribe(&self, endpoint: &Endpoint, topics: &[String]) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display_and_parse() {
        let endpoint = Endpoint::tcp("127.0.0.1", 8000);
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:8000");

        let parsed: Endpoint = "inproc://events:7".parse().unwrap();
        assert_eq!(parsed, Endpoint::inproc("events", 7));
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!("127.0.0.1:8000".parse::<Endpoint>().is_err());
        assert!("udp://127.0.0.1:8000".parse::<Endpoint>().is_err());
        assert!("tcp://:8000".parse::<Endpoint>().is_err());
        assert!("tcp://host:port".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_wildcard_host_addresses() {
        let endpoint = Endpoint::tcp("*", 6000);
        assert_eq!(endpoint.bind_address(), "0.0.0.0:6000");
        assert_eq!(endpoint.connect_address(), "127.0.0.1:6000");
        assert_eq!(endpoint.address(), "*:6000");
    }

    #[tokio::test]
    async fn test_connection_reports_closed_peer() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Connection::new(Endpoint::inproc("pipe", 1), client);
        drop(server);

        let result = client.recv_frame().await;
        assert!(matches!(result, Err(ZerolinkError::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_connection_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Connection::new(Endpoint::inproc("pipe", 2), client);
        let mut server = Connection::new(Endpoint::inproc("pipe", 2), server);

        client.send_frame(b"ping").await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap(), b"ping");
        server.send_frame(b"pong").await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap(), b"pong");

        client.close().await.unwrap();
        assert!(server.try_recv_frame().await.unwrap().is_none());
    }
}
