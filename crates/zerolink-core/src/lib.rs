//! zerolink - lightweight RPC and topic events between services.
//!
//! A service type exposes methods through a [`MethodRegistry`] and reacts to
//! other services' events through an [`EventRegistry`]. A [`Container`] hosts
//! one service instance: it answers calls on a reply endpoint and subscribes to
//! the publishers of the events it handles. A [`ContainerRunner`] keeps
//! containers alive, restarting any that crash. Callers reach a service through
//! an [`RpcProxy`], or through a [`ClusterProxy`] built from a static cluster
//! description.
//!
//! # Example
//!
//! ```rust,ignore
//! use zerolink::{param, Container, Endpoint, MethodRegistry, ParamKind, RpcProxy, RunConfig};
//!
//! let mut methods = MethodRegistry::new();
//! methods.register("sum", vec![param("a", ParamKind::Int), param("b", ParamKind::Int)], |_svc: Arc<Math>, call| async move {
//!     let a: i64 = call.get(0, "a")?;
//!     let b: i64 = call.get(1, "b")?;
//!     Ok(json!(a + b))
//! });
//!
//! let container = Arc::new(Container::<Math>::new(methods));
//! tokio::spawn({
//!     let container = container.clone();
//!     async move { container.run(&RunConfig::new("127.0.0.1", 8000)).await }
//! });
//!
//! let proxy = RpcProxy::new("math", Endpoint::tcp("127.0.0.1", 8000));
//! assert_eq!(proxy.method("sum").call(vec![json!(1), json!(2)]).await?, json!(3));
//! ```

pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod marshal;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod serializer;
pub mod service;
pub mod transport;
pub mod validation;

// Re-export commonly used types
pub use config::{ClusterServiceConfig, RunConfig, Scheme};
pub use container::{Container, ContainerRunner, EventServer, Runnable, RpcServer, ServerControl};
pub use error::{Result, ZerolinkError};
pub use events::{EventDispatcher, EventKey, EventRegistry};
pub use marshal::{
    ErrorCatalog, ErrorHandler, ErrorKind, Fault, RemoteError, RemoteErrorData,
    RemoteErrorHandler, RemoteFault, ServiceError,
};
pub use protocol::{Headers, Kwargs, Meta, Protocol, RpcRequest, RpcResponse};
pub use proxy::{AsyncScope, ClusterProxy, MethodRef, RpcProxy};
pub use registry::{param, CallArgs, MethodKey, MethodRegistry, ParamKind, ParamSpec};
pub use serializer::{JsonSerializer, Serializer};
pub use service::{Service, ServiceContext};
pub use transport::{Broker, Connection, Endpoint, SocketTransport, Transport};
pub use validation::{validate_or_ignore, ValidationHook};
