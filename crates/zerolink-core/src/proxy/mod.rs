//! Client-side proxies.
//!
//! [`RpcProxy`] talks to one remote service, either with blocking round trips
//! or with pipelined async calls inside an [`AsyncScope`]. [`ClusterProxy`]
//! groups proxies of a static cluster description by service name.

mod cluster;
mod rpc_proxy;

pub use cluster::ClusterProxy;
pub use rpc_proxy::{AsyncScope, MethodRef, RpcProxy};
