use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::{lookup_host, TcpStream};

use crate::protocol::error::{Result, RpcError};

/// Opens TCP connections for clients.
///
/// Clients are shared per factory, so [`id`](SocketFactory::id) must be
/// stable and distinct for factories that behave differently.
pub trait SocketFactory: Send + Sync {
    /// Stable identity used to share clients between proxies.
    fn id(&self) -> &str;

    /// Connects to `addr`, giving up after `timeout`.
    ///
    /// A connect that runs out of time must fail with
    /// `io::ErrorKind::TimedOut` so callers can tell it apart from a refusal.
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> BoxFuture<'_, io::Result<TcpStream>>;
}

/// Plain `TcpStream::connect` bounded by a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardSocketFactory;

impl SocketFactory for StandardSocketFactory {
    fn id(&self) -> &str {
        "standard"
    }

    fn connect(&self, addr: SocketAddr, timeout: Duration) -> BoxFuture<'_, io::Result<TcpStream>> {
        async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out after {} ms", timeout.as_millis()),
                )),
            }
        }
        .boxed()
    }
}

/// Resolves `addr` (e.g. "localhost:8080") to its first socket address.
///
/// # Errors
///
/// Returns `RpcError::InvalidArgument` if the address cannot be parsed or
/// resolves to nothing.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(addr)
        .await
        .map_err(|e| RpcError::InvalidArgument(format!("Invalid address '{}': {}", addr, e)))?;
    addrs
        .next()
        .ok_or_else(|| RpcError::InvalidArgument(format!("Address '{}' resolved to nothing", addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_standard_factory_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = StandardSocketFactory
            .connect(addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_standard_factory_refused() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = StandardSocketFactory
            .connect(addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_resolve_addr() {
        let addr = resolve_addr("127.0.0.1:4242").await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(resolve_addr("not an address").await.is_err());
    }
}
