//! Typed proxies over a [`Client`].
//!
//! A protocol is declared once with [`rpc_proxy!`](crate::rpc_proxy), which
//! generates a struct whose async methods turn their arguments into an
//! [`Invocation`] and the reply back into the declared return type.
//! [`get_proxy`] builds such a proxy and checks that client and server agree
//! on the protocol version before handing it out.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;
use wirecall_common::transport::SocketFactory;
use wirecall_common::{Invocation, Result, RpcError, TypeRegistry, TypedValue};

use crate::client::Client;
use crate::config::ClientConfig;

/// Method every versioned protocol answers.
pub const GET_PROTOCOL_VERSION: &str = "getProtocolVersion";

/// Sends invocations for one protocol at one address.
#[derive(Clone)]
pub struct Invoker {
    address: SocketAddr,
    protocol: String,
    client: Arc<Client>,
}

impl Invoker {
    pub fn new(address: SocketAddr, protocol: impl Into<String>, client: Arc<Client>) -> Self {
        Self {
            address,
            protocol: protocol.into(),
            client,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Calls `method` with `params` and returns the undecoded result.
    pub async fn invoke(&self, method: &str, params: Vec<TypedValue>) -> Result<TypedValue> {
        let start = Instant::now();
        let result = self
            .client
            .call(Invocation::new(method, params), self.address, &self.protocol)
            .await;
        debug!(
            method,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "invoke finished"
        );
        result
    }

    /// Asks the server which version of `protocol` it speaks.
    pub async fn get_protocol_version(&self, protocol: &str, client_version: i64) -> Result<i64> {
        let params = vec![
            TypedValue::of(protocol.to_string()),
            TypedValue::of(client_version),
        ];
        self.invoke(GET_PROTOCOL_VERSION, params)
            .await?
            .into_wire()
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("address", &self.address)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Implemented by proxies generated with [`rpc_proxy!`](crate::rpc_proxy).
pub trait ProtocolProxy: Sized {
    /// Protocol name sent in the connection header and version check.
    const PROTOCOL: &'static str;

    fn from_invoker(invoker: Invoker) -> Self;

    fn invoker(&self) -> &Invoker;
}

/// Shares one [`Client`] per socket factory.
///
/// Every [`get_client`](ClientCache::get_client) must be matched by a
/// [`stop_client`](ClientCache::stop_client); the client is stopped when the
/// last user lets go.
#[derive(Debug, Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client for `socket_factory`, creating it on first use.
    ///
    /// An existing client keeps the configuration and types it was created
    /// with.
    pub async fn get_client(
        &self,
        config: &ClientConfig,
        socket_factory: Arc<dyn SocketFactory>,
        types: Arc<TypeRegistry>,
    ) -> Arc<Client> {
        let mut clients = self.clients.lock().await;
        let key = socket_factory.id().to_string();
        match clients.get(&key) {
            Some(client) => {
                client.inc_count();
                client.clone()
            }
            None => {
                let client = Arc::new(Client::with_socket_factory(
                    config.clone(),
                    socket_factory,
                    types,
                ));
                clients.insert(key, client.clone());
                client
            }
        }
    }

    /// Releases one use of `client`, stopping it if it was the last.
    pub async fn stop_client(&self, client: &Arc<Client>) {
        {
            let mut clients = self.clients.lock().await;
            client.dec_count();
            if client.is_zero_ref() {
                clients.remove(client.socket_factory().id());
            }
        }
        if client.is_zero_ref() {
            client.stop().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

/// Builds a proxy for `P` and checks the protocol version.
///
/// # Errors
///
/// Returns `RpcError::VersionMismatch` if the server reports a version other
/// than `client_version`, or the error from the version call itself. No
/// proxy is returned in either case and the client use is released.
pub async fn get_proxy<P: ProtocolProxy>(
    address: SocketAddr,
    client_version: i64,
    config: &ClientConfig,
    socket_factory: Arc<dyn SocketFactory>,
    types: Arc<TypeRegistry>,
    cache: &ClientCache,
) -> Result<P> {
    let client = cache.get_client(config, socket_factory, types).await;
    let proxy = P::from_invoker(Invoker::new(address, P::PROTOCOL, client.clone()));

    let server_version = match proxy
        .invoker()
        .get_protocol_version(P::PROTOCOL, client_version)
        .await
    {
        Ok(version) => version,
        Err(e) => {
            cache.stop_client(&client).await;
            return Err(e);
        }
    };

    if server_version != client_version {
        cache.stop_client(&client).await;
        return Err(RpcError::VersionMismatch {
            interface: P::PROTOCOL.to_string(),
            client_version,
            server_version,
        });
    }
    Ok(proxy)
}

/// Releases the client behind a proxy obtained from [`get_proxy`].
pub async fn stop_proxy<P: ProtocolProxy>(proxy: P, cache: &ClientCache) {
    cache.stop_client(proxy.invoker().client()).await;
}

/// Declares a typed proxy for a remote protocol.
///
/// Each method lists its parameters, return type and the method name used
/// on the wire. Parameter and return types must implement
/// [`WireType`](wirecall_common::WireType).
///
/// # Example
///
/// ```
/// wirecall_client::rpc_proxy! {
///     /// Demo protocol.
///     pub struct Calculator: "demo.Calculator" {
///         fn add(a: i32, b: i32) -> i32 = "add";
///         fn reset() -> () = "reset";
///     }
/// }
/// ```
#[macro_export]
macro_rules! rpc_proxy {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $protocol:literal {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty = $wire:literal ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            invoker: $crate::Invoker,
        }

        impl $crate::ProtocolProxy for $name {
            const PROTOCOL: &'static str = $protocol;

            fn from_invoker(invoker: $crate::Invoker) -> Self {
                Self { invoker }
            }

            fn invoker(&self) -> &$crate::Invoker {
                &self.invoker
            }
        }

        impl $name {
            /// Asks the server which version of `protocol` it speaks.
            pub async fn get_protocol_version(
                &self,
                protocol: &str,
                client_version: i64,
            ) -> $crate::Result<i64> {
                self.invoker.get_protocol_version(protocol, client_version).await
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(&self $(, $arg: $arg_ty)*) -> $crate::Result<$ret> {
                    let params: ::std::vec::Vec<$crate::TypedValue> =
                        ::std::vec![$($crate::WireType::into_typed($arg)),*];
                    let value = self.invoker.invoke($wire, params).await?;
                    <$ret as $crate::WireType>::from_typed(value)
                }
            )*
        }
    };
}
