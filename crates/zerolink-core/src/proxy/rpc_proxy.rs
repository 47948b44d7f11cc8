//! Client-side stand-in for one remote service.

use crate::marshal::{ErrorHandler, RemoteErrorHandler};
use crate::protocol::{Headers, Kwargs, Protocol};
use crate::transport::{Connection, Endpoint};
use crate::{Result, ZerolinkError};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Open connection of one method's async calls. `None` once a send or read
/// on it failed or was cancelled.
type AsyncSlot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// Proxy bound to one remote `(host, port)`.
///
/// Calls are either synchronous round trips ([`invoke`](Self::invoke)) or,
/// inside an async scope ([`enter_async`](Self::enter_async)), a send
/// ([`async_call`](Self::async_call)) whose reply is collected later with
/// [`result`](Self::result). Repeated async calls to the same method share
/// one connection and are answered in order.
pub struct RpcProxy {
    name: String,
    endpoint: Endpoint,
    event_endpoint: Option<Endpoint>,
    headers: Headers,
    protocol: Arc<Protocol>,
    error_handler: Arc<dyn ErrorHandler>,
    method_name: Mutex<String>,
    active_async_calls: Mutex<HashMap<String, AsyncSlot>>,
    is_async_context: AtomicBool,
}

impl RpcProxy {
    /// Proxy for service `name` answering on `endpoint`.
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            event_endpoint: None,
            headers: Headers::new(),
            protocol: Arc::new(Protocol::json()),
            error_handler: Arc::new(RemoteErrorHandler::new()),
            method_name: Mutex::new(String::new()),
            active_async_calls: Mutex::new(HashMap::new()),
            is_async_context: AtomicBool::new(false),
        }
    }

    /// The endpoint the remote service publishes its events on.
    pub fn with_events(mut self, endpoint: Endpoint) -> Self {
        self.event_endpoint = Some(endpoint);
        self
    }

    /// Header sent with every request of this proxy.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn event_endpoint(&self) -> Option<&Endpoint> {
        self.event_endpoint.as_ref()
    }

    pub fn is_async_context(&self) -> bool {
        self.is_async_context.load(Ordering::SeqCst)
    }

    pub(crate) fn set_async_context(&self, enabled: bool) {
        self.is_async_context.store(enabled, Ordering::SeqCst);
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, AsyncSlot>> {
        self.active_async_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Select the method the next [`call`](Self::call) invokes.
    pub fn select(&self, method: &str) -> &Self {
        *self
            .method_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = method.to_string();
        self
    }

    /// The currently selected method.
    pub fn selected(&self) -> String {
        self.method_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Select `method` and get a handle for calling it.
    pub fn method(&self, method: &str) -> MethodRef<'_> {
        self.select(method);
        MethodRef {
            proxy: self,
            method: method.to_string(),
        }
    }

    /// Call the selected method.
    pub async fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let method = self.selected();
        self.invoke(&method, args, kwargs).await
    }

    /// Blocking round trip; a remote failure comes back as
    /// [`ZerolinkError::Remote`].
    pub async fn invoke(&self, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let response = self
            .protocol
            .call(&self.endpoint, method, args, kwargs, Some(&self.headers))
            .await?;
        response.into_result(self.error_handler.as_ref())
    }

    /// Send a call to `method` without waiting for its reply.
    pub async fn async_call(&self, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<()> {
        if !self.is_async_context() {
            return Err(ZerolinkError::AsyncCallOutsideContext);
        }

        let existing = self.calls().get(method).cloned();
        match existing {
            Some(slot) => {
                let mut slot = slot.lock().await;
                let connection = slot.take();
                let connection = self
                    .protocol
                    .send(&self.endpoint, method, args, kwargs, Some(&self.headers), connection)
                    .await?;
                *slot = Some(connection);
            }
            None => {
                let connection = self
                    .protocol
                    .send(&self.endpoint, method, args, kwargs, Some(&self.headers), None)
                    .await?;
                self.calls()
                    .insert(method.to_string(), Arc::new(tokio::sync::Mutex::new(Some(connection))));
            }
        }
        Ok(())
    }

    /// Wait for the next reply to an earlier [`async_call`](Self::async_call)
    /// of `method`.
    ///
    /// Each reply is read once; calling this more often than `async_call`
    /// waits for a reply that never comes.
    pub async fn result(&self, method: &str) -> Result<Value> {
        if !self.is_async_context() {
            return Err(ZerolinkError::AsyncCallOutsideContext);
        }

        let slot = self.calls().get(method).cloned().ok_or_else(|| {
            ZerolinkError::AsyncCallNeverIssued {
                method: method.to_string(),
            }
        })?;

        // Out of the slot while waiting: a cancelled or failed read leaves the
        // slot empty rather than a half-read stream behind.
        let mut slot = slot.lock().await;
        let mut connection = slot.take().ok_or_else(|| ZerolinkError::ConnectionClosed {
            endpoint: self.endpoint.to_string(),
        })?;

        let response = self.protocol.receive(&mut connection).await?;
        *slot = Some(connection);
        response.into_result(self.error_handler.as_ref())
    }

    /// Enter an async scope. Leaving it, however that happens, closes every
    /// connection opened by async calls and restores the async mode the proxy
    /// had before.
    pub fn enter_async(&self) -> AsyncScope<'_> {
        let previous = self.is_async_context.swap(true, Ordering::SeqCst);
        AsyncScope {
            proxy: self,
            previous,
        }
    }

    /// Close every async call connection.
    pub fn close_connections(&self) {
        let closed = std::mem::take(&mut *self.calls());
        if !closed.is_empty() {
            debug!("Closed {} async connection(s) to {}", closed.len(), self.name);
        }
    }

    /// Number of methods with an open async connection.
    pub fn open_connections(&self) -> usize {
        self.calls().len()
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.to_string())
            .field("event_endpoint", &self.event_endpoint.as_ref().map(ToString::to_string))
            .field("is_async_context", &self.is_async_context())
            .finish_non_exhaustive()
    }
}

/// A method of a proxy, selected for calling.
#[derive(Debug, Clone)]
pub struct MethodRef<'a> {
    proxy: &'a RpcProxy,
    method: String,
}

impl MethodRef<'_> {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.proxy.invoke(&self.method, args, Kwargs::new()).await
    }

    pub async fn call_with(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.proxy.invoke(&self.method, args, kwargs).await
    }

    pub async fn async_call(&self, args: Vec<Value>) -> Result<()> {
        self.proxy.async_call(&self.method, args, Kwargs::new()).await
    }

    pub async fn async_call_with(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<()> {
        self.proxy.async_call(&self.method, args, kwargs).await
    }

    pub async fn result(&self) -> Result<Value> {
        self.proxy.result(&self.method).await
    }
}

/// An active async scope of a proxy. Dereferences to the proxy.
#[derive(Debug)]
pub struct AsyncScope<'a> {
    proxy: &'a RpcProxy,
    previous: bool,
}

impl Deref for AsyncScope<'_> {
    type Target = RpcProxy;

    fn deref(&self) -> &RpcProxy {
        self.proxy
    }
}

impl Drop for AsyncScope<'_> {
    fn drop(&mut self) {
        self.proxy.set_async_context(self.previous);
        self.proxy.close_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proxy() -> RpcProxy {
        RpcProxy::new("math", Endpoint::inproc("proxy-test", 1))
    }

    #[tokio::test]
    async fn test_async_call_outside_scope_fails() {
        let proxy = proxy();
        let err = proxy.async_call("sum", vec![json!(1)], Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, ZerolinkError::AsyncCallOutsideContext));
        assert_eq!(err.to_string(), "Async call should be in async context");

        let err = proxy.result("sum").await.unwrap_err();
        assert!(matches!(err, ZerolinkError::AsyncCallOutsideContext));
    }

    #[tokio::test]
    async fn test_result_without_async_call_fails() {
        let proxy = proxy();
        let scope = proxy.enter_async();
        let err = scope.method("sum").result().await.unwrap_err();
        assert_eq!(err.to_string(), "Async call for method sum was never called");
    }

    #[test]
    fn test_scope_exit_resets_context() {
        let proxy = proxy();
        {
            let scope = proxy.enter_async();
            assert!(scope.is_async_context());
        }
        assert!(!proxy.is_async_context());
        assert_eq!(proxy.open_connections(), 0);
    }

    #[test]
    fn test_scope_exit_keeps_permanent_async_mode() {
        let proxy = proxy();
        proxy.set_async_context(true);
        {
            let scope = proxy.enter_async();
            assert!(scope.is_async_context());
        }
        assert!(proxy.is_async_context());
    }

    #[tokio::test]
    async fn test_cancelled_result_empties_the_slot() {
        let mut listener = Protocol::json()
            .transport()
            .bind(&Endpoint::inproc("proxy-test", 2))
            .await
            .unwrap();
        let proxy = RpcProxy::new("math", listener.local_endpoint().clone());
        let scope = proxy.enter_async();

        scope.async_call("sum", vec![json!(1), json!(2)], Kwargs::new()).await.unwrap();
        let _server_side = listener.accept().await.unwrap();

        // Nobody answers; the abandoned read must not stay on the connection.
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            scope.result("sum"),
        )
        .await;
        assert!(waited.is_err());

        let err = scope.result("sum").await.unwrap_err();
        assert!(matches!(err, ZerolinkError::ConnectionClosed { .. }));
    }

    #[test]
    fn test_method_selects_pending_name() {
        let proxy = proxy();
        let method = proxy.method("div");
        assert_eq!(method.name(), "div");
        assert_eq!(proxy.selected(), "div");
        proxy.select("mul");
        assert_eq!(proxy.selected(), "mul");
    }
}
