//! Request, response and event envelopes.
//!
//! Wire format of a call:
//!
//! ```json
//! {"method": "sum", "args": [1, 2], "kwargs": {}, "meta": {"headers": {}}}
//! ```
//!
//! Replies are tagged so that a result which happens to look like an error is
//! never mistaken for one:
//!
//! ```json
//! {"status": "ok", "result": 3}
//! {"status": "error", "error": {"exc_type": "...", "exc_path": "...", "exc_args": [], "value": "..."}}
//! ```
//!
//! Events carry the serialized payload alone; the topic travels in its own frame.

use crate::marshal::{ErrorHandler, RemoteErrorData};
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::{Connection, Endpoint, SocketTransport, Transport};
use crate::{Result, ZerolinkError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Request headers.
pub type Headers = BTreeMap<String, String>;

/// Keyword arguments.
pub type Kwargs = Map<String, Value>;

/// Metadata sent along with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub headers: Headers,
}

/// A remote method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub meta: Meta,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Kwargs, headers: Headers) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs,
            meta: Meta { headers },
        }
    }
}

/// Outcome of a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RpcResponse {
    Ok { result: Value },
    Error { error: RemoteErrorData },
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        RpcResponse::Ok { result }
    }

    pub fn error(error: RemoteErrorData) -> Self {
        RpcResponse::Error { error }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcResponse::Error { .. })
    }

    /// The result value, or the rebuilt remote error.
    pub fn into_result(self, handler: &dyn ErrorHandler) -> Result<Value> {
        match self {
            RpcResponse::Ok { result } => Ok(result),
            RpcResponse::Error { error } => Err(handler.raise_remote_error(error)),
        }
    }
}

/// Envelope building on top of a [`Serializer`] and a [`Transport`].
pub struct Protocol {
    serializer: Arc<dyn Serializer>,
    transport: Arc<dyn Transport>,
}

impl Protocol {
    pub fn new(serializer: Arc<dyn Serializer>, transport: Arc<dyn Transport>) -> Self {
        Self {
            serializer,
            transport,
        }
    }

    /// JSON over the default socket transport.
    pub fn json() -> Self {
        Self::new(Arc::new(JsonSerializer), Arc::new(SocketTransport::new()))
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn build_request(
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        headers: Option<&Headers>,
    ) -> RpcRequest {
        RpcRequest::new(method, args, kwargs, headers.cloned().unwrap_or_default())
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        self.serializer.serialize(&serde_json::to_value(request)?)
    }

    /// Blocking round trip: send the request and wait for its reply.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        headers: Option<&Headers>,
    ) -> Result<RpcResponse> {
        let request = Self::build_request(method, args, kwargs, headers);
        let data = self.encode_request(&request)?;
        let reply = self.transport.request(endpoint, &data).await?;
        self.parse_response(&reply)
    }

    /// Send a request without waiting for the reply.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        headers: Option<&Headers>,
        connection: Option<Connection>,
    ) -> Result<Connection> {
        let request = Self::build_request(method, args, kwargs, headers);
        let data = self.encode_request(&request)?;
        self.transport.send(endpoint, &data, connection).await
    }

    /// Wait for exactly one reply on `connection`.
    pub async fn receive(&self, connection: &mut Connection) -> Result<RpcResponse> {
        let reply = self.transport.receive(connection).await?;
        self.parse_response(&reply)
    }

    /// Publish `payload` under `topic`.
    pub async fn dispatch(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &Value,
        through_broker: bool,
    ) -> Result<()> {
        let data = self.serializer.serialize(payload)?;
        self.transport
            .dispatch(endpoint, topic, &data, through_broker)
            .await
    }

    /// Bind the publisher for `endpoint` ahead of the first dispatch.
    pub async fn open_publisher(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        self.transport.open_publisher(endpoint).await
    }

    pub fn parse_call(&self, data: &[u8]) -> Result<RpcRequest> {
        let value = self.serializer.deserialize(data)?;
        serde_json::from_value(value).map_err(|e| ZerolinkError::Envelope {
            message: format!("Invalid request: {}", e),
        })
    }

    pub fn parse_event(&self, data: &[u8]) -> Result<Value> {
        self.serializer.deserialize(data)
    }

    pub fn build_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        self.serializer.serialize(&serde_json::to_value(response)?)
    }

    pub fn parse_response(&self, data: &[u8]) -> Result<RpcResponse> {
        let value = self.serializer.deserialize(data)?;
        serde_json::from_value(value).map_err(|e| ZerolinkError::Envelope {
            message: format!("Invalid response: {}", e),
        })
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::json()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("serializer", &self.serializer.name())
            .finish_non_exhaustive()
    }
}
