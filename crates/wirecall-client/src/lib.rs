//! wirecall Client
//!
//! Multiplexing connection pool and typed RPC proxies.
//!
//! - [`Client`] keeps one [`Connection`] per (address, protocol) and lets any
//!   number of tasks issue calls over it concurrently
//! - [`rpc_proxy!`] declares a typed proxy for a protocol, and [`get_proxy`]
//!   builds one after checking the protocol version with the server
//! - [`ClientCache`] shares clients between proxies that use the same
//!   socket factory

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod rpc;

pub use call::Call;
pub use client::Client;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionId};
pub use rpc::{get_proxy, stop_proxy, ClientCache, Invoker, ProtocolProxy, GET_PROTOCOL_VERSION};

// used by code generated with `rpc_proxy!`
pub use wirecall_common::{Result, RpcError, TypeRegistry, TypedValue, WireType};
