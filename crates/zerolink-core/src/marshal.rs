//! Carrying service failures across the wire.
//!
//! A service method fails with a [`Fault`]: any value implementing
//! [`RemoteFault`]. The container turns it into [`RemoteErrorData`]
//! (`{exc_type, exc_path, exc_args, value}`) and replies with it. The caller
//! resolves `exc_path` through an [`ErrorCatalog`], rebuilds the fault from
//! `exc_args` and surfaces it wrapped in a [`RemoteError`].
//!
//! Both ends need the path in their catalog. An unknown path is reported as
//! [`ZerolinkError::UnresolvableErrorType`] rather than degraded to a generic
//! error.

use crate::protocol::RpcResponse;
use crate::ZerolinkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Module path under which the built-in error kinds are published.
pub const BUILTIN_ERROR_MODULE: &str = "zerolink.errors";

/// A failure that can be marshalled to a remote caller.
pub trait RemoteFault: std::error::Error + Send + Sync + 'static {
    /// Simple type name, e.g. `ValueError`.
    fn exc_type(&self) -> &str;

    /// Stable path the far side resolves in its [`ErrorCatalog`].
    fn exc_path(&self) -> String;

    /// Arguments that rebuild an equivalent value on the far side.
    fn exc_args(&self) -> Vec<Value> {
        vec![Value::String(self.to_string())]
    }
}

/// A boxed [`RemoteFault`], the error type of service methods and handlers.
///
/// Every `RemoteFault` converts into it, so `?` works inside handlers.
pub struct Fault(Box<dyn RemoteFault>);

impl Fault {
    pub fn new(fault: impl RemoteFault) -> Self {
        Self(Box::new(fault))
    }

    pub fn exc_type(&self) -> &str {
        self.0.exc_type()
    }

    pub fn exc_path(&self) -> String {
        self.0.exc_path()
    }

    pub fn exc_args(&self) -> Vec<Value> {
        self.0.exc_args()
    }

    pub fn as_fault(&self) -> &dyn RemoteFault {
        self.0.as_ref()
    }
}

impl<T: RemoteFault> From<T> for Fault {
    fn from(fault: T) -> Self {
        Self(Box::new(fault))
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Built-in error kinds every catalog knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Exception,
    Value,
    Type,
    ZeroDivision,
    Key,
    Runtime,
    /// The method panicked.
    Panic,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Exception,
        ErrorKind::Value,
        ErrorKind::Type,
        ErrorKind::ZeroDivision,
        ErrorKind::Key,
        ErrorKind::Runtime,
        ErrorKind::Panic,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Exception => "Exception",
            ErrorKind::Value => "ValueError",
            ErrorKind::Type => "TypeError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Panic => "PanicError",
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}", BUILTIN_ERROR_MODULE, self.type_name())
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.strip_prefix(BUILTIN_ERROR_MODULE)?.strip_prefix('.')?;
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

/// Built-in service failure: a kind plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    kind: ErrorKind,
    message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exception, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ZeroDivision, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panic, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl RemoteFault for ServiceError {
    fn exc_type(&self) -> &str {
        self.kind.type_name()
    }

    fn exc_path(&self) -> String {
        self.kind.path()
    }
}

/// Framework errors raised inside a handler (a nested proxy call, a failed
/// dispatch) travel on as runtime errors; nested remote errors keep their
/// original type.
impl RemoteFault for ZerolinkError {
    fn exc_type(&self) -> &str {
        match self {
            ZerolinkError::Remote(remote) => remote.exc_type(),
            _ => ErrorKind::Runtime.type_name(),
        }
    }

    fn exc_path(&self) -> String {
        match self {
            ZerolinkError::Remote(remote) => remote.exc_path().to_string(),
            _ => ErrorKind::Runtime.path(),
        }
    }

    fn exc_args(&self) -> Vec<Value> {
        match self {
            ZerolinkError::Remote(remote) => remote.original().exc_args(),
            _ => vec![Value::String(self.to_string())],
        }
    }
}

/// Wire form of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorData {
    pub exc_type: String,
    pub exc_path: String,
    #[serde(default)]
    pub exc_args: Vec<Value>,
    pub value: String,
}

impl RemoteErrorData {
    pub fn from_fault(fault: &Fault) -> Self {
        Self {
            exc_type: fault.exc_type().to_string(),
            exc_path: fault.exc_path(),
            exc_args: fault.exc_args(),
            value: fault.to_string(),
        }
    }
}

/// A failure raised by the remote side, rebuilt locally.
#[derive(Debug, Error)]
#[error("{exc_type}: {message}")]
pub struct RemoteError {
    exc_type: String,
    exc_path: String,
    message: String,
    #[source]
    original: Fault,
}

impl RemoteError {
    pub fn new(original: Fault, message: impl Into<String>) -> Self {
        Self {
            exc_type: original.exc_type().to_string(),
            exc_path: original.exc_path(),
            message: message.into(),
            original,
        }
    }

    pub fn exc_type(&self) -> &str {
        &self.exc_type
    }

    pub fn exc_path(&self) -> &str {
        &self.exc_path
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The rebuilt fault.
    pub fn original(&self) -> &Fault {
        &self.original
    }

    /// Built-in kind of the original fault, if it is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_path(&self.exc_path)
    }

    pub fn to_data(&self) -> RemoteErrorData {
        RemoteErrorData {
            exc_type: self.exc_type.clone(),
            exc_path: self.exc_path.clone(),
            exc_args: self.original.exc_args(),
            value: self.message.clone(),
        }
    }
}

/// Builds a fault from its marshalled arguments and message.
pub type FaultConstructor = Arc<dyn Fn(&[Value], &str) -> Fault + Send + Sync>;

/// Maps error paths to local constructors.
#[derive(Clone)]
pub struct ErrorCatalog {
    constructors: HashMap<String, FaultConstructor>,
}

impl ErrorCatalog {
    /// A catalog with no entries at all.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A catalog with every [`ErrorKind`] registered.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        for kind in ErrorKind::ALL {
            catalog.register(kind.path(), move |args, value| {
                let message = match args.first() {
                    Some(Value::String(message)) => message.clone(),
                    Some(other) => other.to_string(),
                    None => value.to_string(),
                };
                Fault::new(ServiceError::new(kind, message))
            });
        }
        catalog
    }

    /// Register (or replace) the constructor for `path`.
    pub fn register<F>(&mut self, path: impl Into<String>, constructor: F)
    where
        F: Fn(&[Value], &str) -> Fault + Send + Sync + 'static,
    {
        self.constructors.insert(path.into(), Arc::new(constructor));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.constructors.contains_key(path)
    }

    /// Rebuild the fault described by `data`.
    pub fn resolve(&self, data: &RemoteErrorData) -> crate::Result<Fault> {
        let constructor = self.constructors.get(&data.exc_path).ok_or_else(|| {
            ZerolinkError::UnresolvableErrorType {
                path: data.exc_path.clone(),
            }
        })?;
        Ok(constructor(&data.exc_args, &data.value))
    }
}

impl Default for ErrorCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ErrorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self.constructors.keys().collect();
        paths.sort();
        f.debug_struct("ErrorCatalog").field("paths", &paths).finish()
    }
}

/// Converts faults to wire data on the server and back on the client.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle_fault(&self, fault: &Fault) -> RemoteErrorData;

    fn is_remote_error(&self, response: &RpcResponse) -> bool {
        matches!(response, RpcResponse::Error { .. })
    }

    /// The error a caller sees for `data`.
    fn raise_remote_error(&self, data: RemoteErrorData) -> ZerolinkError;
}

/// Default [`ErrorHandler`] backed by an [`ErrorCatalog`].
#[derive(Debug, Clone, Default)]
pub struct RemoteErrorHandler {
    catalog: ErrorCatalog,
}

impl RemoteErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: ErrorCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ErrorCatalog {
        &self.catalog
    }
}

impl ErrorHandler for RemoteErrorHandler {
    fn handle_fault(&self, fault: &Fault) -> RemoteErrorData {
        RemoteErrorData::from_fault(fault)
    }

    fn raise_remote_error(&self, data: RemoteErrorData) -> ZerolinkError {
        match self.catalog.resolve(&data) {
            Ok(original) => ZerolinkError::Remote(RemoteError::new(original, data.value)),
            Err(e) => e,
        }
    }
}
