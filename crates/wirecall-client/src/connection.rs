use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use wirecall_common::protocol::{encode_call, encode_ping, peek_call_id, ConnectionHeader, ResponseFrame};
use wirecall_common::transport::codec::check_frame_len;
use wirecall_common::transport::{write_frame, write_handshake, SocketFactory};
use wirecall_common::{CallId, Result, RpcError, TypeRegistry};

use crate::call::Call;
use crate::config::ClientConfig;

/// Connections shared by one client, keyed by where and what they talk to.
#[derive(Default)]
pub(crate) struct ConnectionPool {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    /// Fired whenever a connection leaves the pool.
    released: Notify,
}

impl ConnectionPool {
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.lock().await
    }

    /// Removes `connection` if it is still the one pooled under its id.
    pub(crate) async fn remove(&self, connection: &Connection) {
        let mut connections = self.connections.lock().await;
        let is_current = connections
            .get(&connection.remote_id)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection));
        if is_current {
            connections.remove(&connection.remote_id);
            drop(connections);
            self.released.notify_waiters();
        }
    }

    /// Waits until no connection is left.
    pub(crate) async fn drained(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.connections.lock().await.is_empty() {
                return;
            }
            released.await;
        }
    }
}

/// Key of a pooled connection.
///
/// Two ids are equal when both the address and the protocol name are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    address: SocketAddr,
    protocol: String,
}

impl ConnectionId {
    pub fn new(address: SocketAddr, protocol: impl Into<String>) -> Self {
        Self {
            address,
            protocol: protocol.into(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol, self.address)
    }
}

enum ConnectionState {
    Unconnected,
    Open(BufWriter<OwnedWriteHalf>),
    Closed,
}

/// One TCP connection multiplexing many calls.
///
/// The socket is opened lazily by the first call routed here. From then on a
/// dedicated receive task is the only reader; it matches responses to calls
/// by id, sends pings while waiting on a quiet socket, and closes the
/// connection once it has been idle for `max_idle_time`. Writers take turns
/// on the write half through the state lock.
pub struct Connection {
    remote_id: ConnectionId,
    header: ConnectionHeader,
    config: ClientConfig,
    socket_factory: Arc<dyn SocketFactory>,
    types: Arc<TypeRegistry>,
    pool: Weak<ConnectionPool>,
    calls: std::sync::Mutex<HashMap<CallId, Call>>,
    /// Doubles as the write lock.
    state: Mutex<ConnectionState>,
    started: Instant,
    /// Milliseconds after `started` of the last successful I/O.
    last_activity: AtomicU64,
    should_close: AtomicBool,
    close_reason: std::sync::Mutex<Option<RpcError>>,
    work: Notify,
}

impl Connection {
    pub(crate) fn new(
        remote_id: ConnectionId,
        config: ClientConfig,
        socket_factory: Arc<dyn SocketFactory>,
        types: Arc<TypeRegistry>,
        pool: Weak<ConnectionPool>,
    ) -> Arc<Self> {
        let header = ConnectionHeader::new(remote_id.protocol.clone());
        Arc::new(Self {
            remote_id,
            header,
            config,
            socket_factory,
            types,
            pool,
            calls: std::sync::Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Unconnected),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            should_close: AtomicBool::new(false),
            close_reason: std::sync::Mutex::new(None),
            work: Notify::new(),
        })
    }

    pub fn remote_id(&self) -> &ConnectionId {
        &self.remote_id
    }

    /// True once the connection has been marked for shutdown.
    pub fn is_closing(&self) -> bool {
        self.should_close.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.calls().len()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<CallId, Call>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_reason(&self) -> MutexGuard<'_, Option<RpcError>> {
        self.close_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity.store(now, Ordering::SeqCst);
    }

    fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last)
    }

    /// Registers `call` with this connection.
    ///
    /// Hands the call back if the connection is already shutting down, so
    /// the caller can route it to a fresh connection.
    pub(crate) fn add_call(&self, call: Call) -> std::result::Result<(), Call> {
        let mut calls = self.calls();
        if self.is_closing() {
            return Err(call);
        }
        calls.insert(call.id(), call);
        drop(calls);
        self.work.notify_one();
        Ok(())
    }

    /// Forgets call `id` without completing it.
    ///
    /// Used when the caller stops waiting. Returns false if the call had
    /// already been completed or failed.
    pub(crate) fn remove_call(&self, id: CallId) -> bool {
        let removed = self.calls().remove(&id).is_some();
        if removed {
            self.work.notify_one();
        }
        removed
    }

    /// Opens the socket and starts the receive task, unless that already
    /// happened.
    ///
    /// # Errors
    ///
    /// Returns the last connect or handshake error once the retry budget is
    /// spent. The connection is closed by then and its calls have failed
    /// with the same error.
    pub(crate) async fn setup_io_streams(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, ConnectionState::Unconnected) {
            return Ok(());
        }
        if self.is_closing() {
            *state = ConnectionState::Closed;
            drop(state);
            self.close().await;
            return Ok(());
        }

        debug!(remote = %self.remote_id, "Connecting to server");
        match self.connect_and_handshake().await {
            Ok((reader, writer)) => {
                *state = ConnectionState::Open(writer);
                drop(state);
                self.touch();

                let connection = self.clone();
                tokio::spawn(async move { connection.run(BufReader::new(reader)).await });
                Ok(())
            }
            Err(e) => {
                *state = ConnectionState::Closed;
                drop(state);
                self.mark_closed(Some(e.clone()));
                self.close().await;
                Err(e)
            }
        }
    }

    async fn connect_and_handshake(&self) -> Result<(OwnedReadHalf, BufWriter<OwnedWriteHalf>)> {
        let stream = self.connect_with_retries().await?;
        stream.set_nodelay(self.config.tcp_no_delay)?;

        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        write_handshake(&mut writer, &self.header).await?;
        Ok((reader, writer))
    }

    /// Connect timeouts and other failures are counted against separate
    /// budgets.
    async fn connect_with_retries(&self) -> Result<TcpStream> {
        let addr = self.remote_id.address;
        let mut io_failures = 0;
        let mut timeout_failures = 0;

        loop {
            match self
                .socket_factory
                .connect(addr, self.config.connect_timeout())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    self.handle_connection_failure(
                        timeout_failures,
                        self.config.max_retries_on_timeouts,
                        e,
                    )
                    .await?;
                    timeout_failures += 1;
                }
                Err(e) => {
                    self.handle_connection_failure(io_failures, self.config.max_retries, e)
                        .await?;
                    io_failures += 1;
                }
            }
        }
    }

    async fn handle_connection_failure(
        &self,
        cur_retries: u32,
        max_retries: u32,
        err: io::Error,
    ) -> Result<()> {
        if cur_retries >= max_retries {
            return Err(err.into());
        }

        tokio::time::sleep(self.config.retry_interval()).await;
        info!(
            error = %err,
            "Retrying connect to server: {}. Already tried {} time(s).",
            self.remote_id.address,
            cur_retries + 1
        );
        Ok(())
    }

    /// Writes the request for call `id`.
    ///
    /// A call that cannot be encoded fails on its own; a failed write
    /// brings the whole connection down.
    pub(crate) async fn send_param(&self, id: CallId) {
        let body = {
            let mut calls = self.calls();
            let Some(call) = calls.get(&id) else {
                // already completed by a close
                return;
            };
            match encode_call(id, call.param()) {
                Ok(body) => body,
                Err(e) => {
                    if let Some(call) = calls.remove(&id) {
                        call.set_error(e);
                    }
                    return;
                }
            }
        };

        debug!(remote = %self.remote_id, call_id = id, "sending call");
        let mut state = self.state.lock().await;
        let ConnectionState::Open(writer) = &mut *state else {
            return;
        };
        match write_frame(writer, &body).await {
            Ok(()) => self.touch(),
            Err(e) => {
                drop(state);
                self.mark_closed(Some(e));
            }
        }
    }

    async fn run(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        let connections = self.pool_size().await;
        debug!(remote = %self.remote_id, "starting, having connections {}", connections);

        while self.wait_for_work().await {
            if let Err(e) = self.receive_response(&mut reader).await {
                self.mark_closed(Some(e));
            }
        }

        self.close().await;
        let connections = self.pool_size().await;
        debug!(remote = %self.remote_id, "stopped, remaining connections {}", connections);
    }

    async fn pool_size(&self) -> usize {
        match self.pool.upgrade() {
            Some(pool) => pool.lock().await.len(),
            None => 0,
        }
    }

    /// Waits until there is a response to read.
    ///
    /// Returns false when the connection should shut down, either because
    /// it was marked for closing or because it sat idle with no calls for
    /// `max_idle_time`.
    async fn wait_for_work(&self) -> bool {
        loop {
            if self.is_closing() {
                return false;
            }

            let wait = {
                // held until the close flag is set, so add_call either lands
                // first or sees the flag and goes elsewhere
                let calls = self.calls();
                if !calls.is_empty() {
                    return true;
                }

                let idle = self.idle_time();
                let max_idle = self.config.max_idle_time();
                if idle >= max_idle {
                    debug!(remote = %self.remote_id, idle_ms = idle.as_millis() as u64, "closing idle connection");
                    self.mark_closed(None);
                    return false;
                }
                max_idle - idle
            };

            tokio::select! {
                _ = self.work.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn receive_response<R>(&self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        if !self.read_fully(reader, &mut len_buf, true).await? {
            return Ok(());
        }
        let len = check_frame_len(u32::from_be_bytes(len_buf))?;
        let mut body = vec![0u8; len];
        self.read_fully(reader, &mut body, false).await?;
        self.touch();

        let frame = match ResponseFrame::decode(&body, &self.types) {
            Ok(frame) => frame,
            Err(e) => {
                // the frame boundary is intact; only this call is lost
                let Some(id) = peek_call_id(&body) else {
                    return Err(e);
                };
                warn!(remote = %self.remote_id, call_id = id, error = %e, "undecodable response");
                if let Some(call) = self.calls().remove(&id) {
                    call.set_error(e);
                }
                return Ok(());
            }
        };

        debug!(remote = %self.remote_id, call_id = frame.call_id, "got value");
        let call = self.calls().remove(&frame.call_id);
        match call {
            Some(call) => call.complete(frame.response.into_result()),
            None => warn!(remote = %self.remote_id, call_id = frame.call_id, "response for unknown call"),
        }
        Ok(())
    }

    /// Fills `buf`, sending a ping every time the socket stays quiet for
    /// the ping interval.
    ///
    /// With `at_frame_start`, stops pinging once no call is waiting any more
    /// and returns false, provided nothing of the frame has arrived yet.
    async fn read_fully<R>(&self, reader: &mut R, buf: &mut [u8], at_frame_start: bool) -> Result<bool>
    where
        R: AsyncRead + Unpin,
    {
        let mut filled = 0;
        while filled < buf.len() {
            let read = tokio::time::timeout(
                self.config.ping_interval(),
                reader.read(&mut buf[filled..]),
            )
            .await;
            match read {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    )
                    .into())
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if at_frame_start && filled == 0 && self.calls().is_empty() => {
                    return Ok(false)
                }
                Err(_) => self.handle_timeout().await?,
            }
        }
        Ok(true)
    }

    async fn handle_timeout(&self) -> Result<()> {
        if self.is_closing() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out").into());
        }
        self.send_ping().await
    }

    async fn send_ping(&self) -> Result<()> {
        if self.idle_time() < self.config.ping_interval() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if let ConnectionState::Open(writer) = &mut *state {
            debug!(remote = %self.remote_id, "sending ping");
            write_frame(writer, &encode_ping()).await?;
        }
        drop(state);
        self.touch();
        Ok(())
    }

    /// Flags the connection for shutdown, keeping the first reason given.
    ///
    /// Only the flag is set here; the receive task (or a pending setup)
    /// notices it and performs the actual close.
    pub fn mark_closed(&self, reason: Option<RpcError>) {
        let mut slot = self.close_reason();
        if self
            .should_close
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *slot = reason;
            drop(slot);
            self.work.notify_one();
        }
    }

    /// Closes a connection nobody is going to open any more.
    ///
    /// Used when stopping a client: a connection whose socket was never
    /// created has no receive task to close it.
    pub(crate) async fn close_if_unconnected(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            // a setup is in flight and will see the flag
            return;
        };
        if matches!(*state, ConnectionState::Unconnected) {
            *state = ConnectionState::Closed;
            drop(state);
            self.close().await;
        }
    }

    async fn close(&self) {
        if !self.is_closing() {
            warn!(remote = %self.remote_id, "The connection is not in the closed state");
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.remove(self).await;
        }

        *self.state.lock().await = ConnectionState::Closed;

        let reason = self.close_reason().clone();
        let calls: Vec<Call> = self.calls().drain().map(|(_, call)| call).collect();
        let reason = match reason {
            Some(reason) => {
                debug!(remote = %self.remote_id, error = %reason, "closing connection");
                reason
            }
            None => {
                if !calls.is_empty() {
                    warn!(remote = %self.remote_id, "A connection is closed for no cause and calls are not empty");
                }
                RpcError::ConnectionClosed
            }
        };
        for call in calls {
            call.set_error(reason.clone());
        }
        debug!(remote = %self.remote_id, "closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.remote_id)
            .field("pending_calls", &self.pending_calls())
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;
    use std::hash::{Hash, Hasher};
    use wirecall_common::transport::StandardSocketFactory;
    use wirecall_common::Invocation;

    fn hash_of(id: &ConnectionId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_connection_id_equality_and_hash() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let a = ConnectionId::new(addr, "demo.Foo");
        let b = ConnectionId::new(addr, "demo.Foo".to_string());
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let other_protocol = ConnectionId::new(addr, "demo.Bar");
        let other_addr = ConnectionId::new("127.0.0.1:9001".parse().unwrap(), "demo.Foo");
        assert_ne!(a, other_protocol);
        assert_ne!(a, other_addr);

        let set: HashSet<_> = [a, b, other_protocol, other_addr].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    fn unconnected() -> Arc<Connection> {
        unconnected_with(ClientConfig::default())
    }

    fn unconnected_with(config: ClientConfig) -> Arc<Connection> {
        Connection::new(
            ConnectionId::new("127.0.0.1:1".parse().unwrap(), "demo.Foo"),
            config,
            Arc::new(StandardSocketFactory),
            Arc::new(TypeRegistry::new()),
            Weak::new(),
        )
    }

    #[tokio::test]
    async fn test_add_call_refused_once_closing() {
        let connection = unconnected();
        let (call, _rx) = Call::new(0, Invocation::new("m", vec![]));
        assert!(connection.add_call(call).is_ok());

        connection.mark_closed(None);
        let (call, _rx) = Call::new(1, Invocation::new("m", vec![]));
        let rejected = connection.add_call(call).unwrap_err();
        assert_eq!(rejected.id(), 1);
        assert_eq!(connection.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_without_reason_fails_pending_calls() {
        let connection = unconnected();
        let mut receivers = Vec::new();
        for id in 0..3 {
            let (call, rx) = Call::new(id, Invocation::new("m", vec![]));
            connection.add_call(call).unwrap();
            receivers.push(rx);
        }

        connection.mark_closed(None);
        connection.close_if_unconnected().await;

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::ConnectionClosed));
            assert_eq!(err.to_string(), "Unexpected closed connection");
        }
        assert_eq!(connection.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let connection = unconnected();
        let (call, rx) = Call::new(0, Invocation::new("m", vec![]));
        connection.add_call(call).unwrap();

        connection.mark_closed(Some(RpcError::protocol("first")));
        connection.mark_closed(Some(RpcError::protocol("second")));
        connection.close_if_unconnected().await;

        match rx.await.unwrap() {
            Err(RpcError::Protocol(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_removed_call_lets_connection_go_idle() {
        let connection = unconnected_with(ClientConfig::default().with_max_idle_time_ms(0));
        let (call, _rx) = Call::new(0, Invocation::new("m", vec![]));
        connection.add_call(call).unwrap();
        assert!(connection.wait_for_work().await);

        assert!(connection.remove_call(0));
        assert!(!connection.remove_call(0));
        assert!(!connection.wait_for_work().await);
        assert!(connection.is_closing());

        let (call, _rx) = Call::new(1, Invocation::new("m", vec![]));
        assert!(connection.add_call(call).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_close_and_add_call_agree() {
        for id in 0..200 {
            let connection = unconnected_with(ClientConfig::default().with_max_idle_time_ms(0));

            let adder = connection.clone();
            let added = tokio::spawn(async move {
                let (call, rx) = Call::new(id, Invocation::new("m", vec![]));
                (adder.add_call(call).is_ok(), rx)
            });
            let waiter = connection.clone();
            let has_work = tokio::spawn(async move { waiter.wait_for_work().await });

            let (added, _rx) = added.await.unwrap();
            let has_work = has_work.await.unwrap();
            // an accepted call is never stranded on an idle-closed connection
            assert_eq!(added, has_work, "iteration {id}");
        }
    }
}
