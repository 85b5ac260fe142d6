use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;
use wirecall_common::transport::{SocketFactory, StandardSocketFactory};
use wirecall_common::{CallId, Invocation, Result, RpcError, TypeRegistry, TypedValue};

use crate::call::Call;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId, ConnectionPool};

/// Multiplexing RPC client.
///
/// Keeps one [`Connection`] per (address, protocol) pair and routes every
/// call through it, so any number of tasks can share a socket. Call ids come
/// from a per-client counter.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wirecall_client::{Client, ClientConfig};
/// use wirecall_common::{Invocation, TypeRegistry, TypedValue};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(ClientConfig::default(), Arc::new(TypeRegistry::new()));
///
/// let invocation = Invocation::new("echo", vec![TypedValue::of("hi".to_string())]);
/// let reply = client
///     .call(invocation, "127.0.0.1:8080".parse()?, "demo.EchoProtocol")
///     .await?;
/// println!("{}", reply);
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    connections: Arc<ConnectionPool>,
    counter: AtomicU32,
    ref_count: AtomicUsize,
    running: AtomicBool,
    config: ClientConfig,
    socket_factory: Arc<dyn SocketFactory>,
    types: Arc<TypeRegistry>,
}

impl Client {
    /// Creates a client that opens plain TCP sockets.
    pub fn new(config: ClientConfig, types: Arc<TypeRegistry>) -> Self {
        Self::with_socket_factory(config, Arc::new(StandardSocketFactory), types)
    }

    pub fn with_socket_factory(
        config: ClientConfig,
        socket_factory: Arc<dyn SocketFactory>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionPool::default()),
            counter: AtomicU32::new(0),
            ref_count: AtomicUsize::new(1),
            running: AtomicBool::new(true),
            config,
            socket_factory,
            types,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    fn next_call_id(&self) -> CallId {
        // stays non-negative so it never collides with the ping id
        (self.counter.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff) as CallId
    }

    /// Sends `param` to the `protocol` server at `addr` and waits for the
    /// result.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` exactly as the server reported it
    /// - `RpcError::Call` wrapping any local failure (connect, timeout, I/O,
    ///   decoding) together with `addr`
    ///
    /// Dropping the returned future stops the wait but not the call: the
    /// request may still reach the server, and its response is discarded.
    /// The connection forgets the call, so it can still go idle and close.
    pub async fn call(&self, param: Invocation, addr: SocketAddr, protocol: &str) -> Result<TypedValue> {
        let id = self.next_call_id();
        let (call, done) = Call::new(id, param);
        let remote_id = ConnectionId::new(addr, protocol);

        let connection = self
            .get_connection(remote_id, call)
            .await
            .map_err(|e| RpcError::wrap_call(addr, e))?;
        let mut pending = PendingCall {
            connection: &connection,
            id,
            waiting: true,
        };

        // setup failures reach the call through the connection closing
        let dispatch = connection.clone();
        tokio::spawn(async move {
            if dispatch.setup_io_streams().await.is_ok() {
                dispatch.send_param(id).await;
            }
        });

        let result = done.await;
        pending.waiting = false;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RpcError::wrap_call(addr, e)),
            Err(_) => Err(RpcError::wrap_call(addr, RpcError::ConnectionClosed)),
        }
    }

    /// Finds or creates the connection for `remote_id` and registers `call`
    /// with it.
    ///
    /// A connection that is shutting down refuses new calls; it is dropped
    /// from the pool and the call goes to a fresh one.
    async fn get_connection(&self, remote_id: ConnectionId, call: Call) -> Result<Arc<Connection>> {
        let mut call = call;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(RpcError::Io(Arc::new(io::Error::other("The client is stopped"))));
            }

            let connection = {
                let mut connections = self.connections.lock().await;
                connections
                    .entry(remote_id.clone())
                    .or_insert_with(|| {
                        Connection::new(
                            remote_id.clone(),
                            self.config.clone(),
                            self.socket_factory.clone(),
                            self.types.clone(),
                            Arc::downgrade(&self.connections),
                        )
                    })
                    .clone()
            };

            match connection.add_call(call) {
                Ok(()) => return Ok(connection),
                Err(rejected) => {
                    call = rejected;
                    self.connections.remove(&connection).await;
                }
            }
        }
    }

    /// Number of pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub fn inc_count(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_count(&self) {
        let _ = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn is_zero_ref(&self) -> bool {
        self.ref_count.load(Ordering::SeqCst) == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the client: every connection is marked closed and this waits,
    /// woken by each removal, until all of them have left the pool.
    ///
    /// Calls still waiting on a connection fail once its receive task
    /// notices the shutdown, at the latest after one ping interval.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("Stopping client");

        let connections: Vec<Arc<Connection>> =
            self.connections.lock().await.values().cloned().collect();
        for connection in &connections {
            connection.mark_closed(None);
            connection.close_if_unconnected().await;
        }

        self.connections.drained().await;
    }
}

/// Takes a call back out of its connection if the caller stops waiting for
/// it.
struct PendingCall<'a> {
    connection: &'a Connection,
    id: CallId,
    waiting: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.waiting && self.connection.remove_call(self.id) {
            debug!(remote = %self.connection.remote_id(), call_id = self.id, "call abandoned by caller");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("socket_factory", &self.socket_factory.id())
            .field("ref_count", &self.ref_count.load(Ordering::SeqCst))
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(ClientConfig::default(), Arc::new(TypeRegistry::new()))
    }

    #[test]
    fn test_call_ids_start_at_zero() {
        let client = client();
        let ids: Vec<CallId> = (0..5).map(|_| client.next_call_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_call_ids_never_negative() {
        let client = client();
        client.counter.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.next_call_id(), 0x7fff_ffff);
        assert_eq!(client.next_call_id(), 0);
    }

    #[test]
    fn test_ref_counting() {
        let client = client();
        assert!(!client.is_zero_ref());
        client.inc_count();
        client.dec_count();
        assert!(!client.is_zero_ref());
        client.dec_count();
        assert!(client.is_zero_ref());
        // never underflows
        client.dec_count();
        assert!(client.is_zero_ref());
    }

    #[tokio::test]
    async fn test_stopped_client_refuses_calls() {
        let client = client();
        client.stop().await;
        assert!(!client.is_running());

        let err = client
            .call(
                Invocation::new("m", vec![]),
                "127.0.0.1:1".parse().unwrap(),
                "demo.Foo",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("The client is stopped"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_wrapped() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = client();

        let err = client
            .call(Invocation::new("m", vec![]), addr, "demo.Foo")
            .await
            .unwrap_err();
        match &err {
            RpcError::Call { addr: a, .. } => assert_eq!(*a, addr),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(err.root_cause(), RpcError::Connection(_)));
        assert_eq!(client.connection_count().await, 0);
    }
}
