use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::error::Result;
use crate::protocol::frame::{peek_call_id, CallId, RequestFrame, Response, ResponseFrame, PING_CALL_ID};
use crate::protocol::invocation::Invocation;
use crate::transport::codec::{read_frame, read_handshake, write_frame};
use crate::wire::{TypeRegistry, TypedValue};

/// One decoded call handed to the server's handler.
#[derive(Debug, Clone)]
pub struct ServerCall {
    pub call_id: CallId,
    /// Protocol named in the connection header.
    pub protocol: String,
    pub invocation: Invocation,
    pub peer: SocketAddr,
}

/// Async TCP server speaking the call-frame protocol.
///
/// Every accepted connection gets its own task. Calls on a connection are
/// dispatched concurrently, so responses may go out in a different order
/// than requests came in; the call id ties them together.
pub struct RpcServer {
    listener: TcpListener,
    types: Arc<TypeRegistry>,
}

impl RpcServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:8080")
    /// * `types` - Registry used to decode call parameters
    pub async fn new(bind_addr: &str, types: TypeRegistry) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            types: Arc::new(types),
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the server with the given call handler.
    ///
    /// The handler's error, if any, is sent back to the caller as an error
    /// response; `RpcError::Remote` keeps its class and message.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TypedValue>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(addr = ?self.listener.local_addr().ok(), "RPC server listening");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(peer = %peer, "Connection established");

            let handler = handler.clone();
            let types = self.types.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, types, handler).await {
                    warn!(peer = %peer, error = %e, "Connection error");
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(
    stream: TcpStream,
    peer: SocketAddr,
    types: Arc<TypeRegistry>,
    handler: Arc<F>,
) -> Result<()>
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TypedValue>> + Send + 'static,
{
    let (mut reader, writer) = stream.into_split();
    let header = read_handshake(&mut reader).await?;
    let protocol = header.protocol().to_string();
    debug!(peer = %peer, protocol = %protocol, "Connection header received");

    let writer = Arc::new(Mutex::new(writer));

    loop {
        let body = match read_frame(&mut reader).await {
            Ok(body) => body,
            Err(e) if e.is_eof() => {
                debug!(peer = %peer, "Connection closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match RequestFrame::decode(&body, &types) {
            Ok(RequestFrame::Ping) => {
                debug!(peer = %peer, "ping");
            }
            Ok(RequestFrame::Call {
                call_id,
                invocation,
            }) => {
                let call = ServerCall {
                    call_id,
                    protocol: protocol.clone(),
                    invocation,
                    peer,
                };
                let handler = handler.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let response = Response::from_result(handler(call).await);
                    if let Err(e) = send_response(&writer, ResponseFrame::new(call_id, response)).await {
                        warn!(call_id, error = %e, "Failed to send response");
                    }
                });
            }
            Err(e) => match peek_call_id(&body) {
                Some(call_id) if call_id != PING_CALL_ID => {
                    warn!(call_id, error = %e, "Failed to decode call");
                    let response = Response::from_result(Err(e));
                    send_response(&writer, ResponseFrame::new(call_id, response)).await?;
                }
                _ => return Err(e),
            },
        }
    }
}

async fn send_response(writer: &Mutex<OwnedWriteHalf>, frame: ResponseFrame) -> Result<()> {
    let body = match frame.encode() {
        Ok(body) => body,
        // the value could not be written; tell the caller instead
        Err(e) => ResponseFrame::new(frame.call_id, Response::from_result(Err(e))).encode()?,
    };
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &body).await
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("types", &self.types.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rpc_server_creation() {
        let server = RpcServer::new("127.0.0.1:0", TypeRegistry::new()).await;
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_rpc_server_local_addr() {
        let server = RpcServer::new("127.0.0.1:0", TypeRegistry::new())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
