use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

/// Which family of local failure a call ran into.
///
/// Used to give the caller the target address plus a coarse reason when a
/// call fails for anything other than an error raised by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Connection refused or otherwise impossible to establish
    Connection,
    /// Socket timeout while connecting or reading
    Timeout,
    /// Any other local failure
    Local,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Connection => f.write_str("connection"),
            CallFailure::Timeout => f.write_str("socket timeout"),
            CallFailure::Local => f.write_str("local"),
        }
    }
}

/// Errors produced anywhere in the wirecall stack.
///
/// The type is `Clone` because a single close reason is delivered to every
/// call still outstanding on a connection; I/O errors are shared behind an
/// `Arc` for that reason.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    Connection(#[source] Arc<io::Error>),

    #[error("Socket timeout: {0}")]
    Timeout(#[source] Arc<io::Error>),

    #[error("Remote error {class}: {message}")]
    Remote { class: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(
        "Protocol {interface} version mismatch. (client = {client_version}, server = {server_version})"
    )]
    VersionMismatch {
        interface: String,
        client_version: i64,
        server_version: i64,
    },

    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Unexpected closed connection")]
    ConnectionClosed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Call to {addr} failed on {kind} exception: {source}")]
    Call {
        addr: SocketAddr,
        kind: CallFailure,
        #[source]
        source: Box<RpcError>,
    },
}

impl RpcError {
    /// Builds a protocol error from anything printable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        RpcError::Protocol(msg.into())
    }

    /// Wraps a local failure with the address the call was sent to.
    ///
    /// Errors raised by the remote side are returned untouched; everything
    /// else keeps the original error as its source.
    pub fn wrap_call(addr: SocketAddr, err: RpcError) -> Self {
        let kind = match &err {
            RpcError::Remote { .. } => return err,
            RpcError::Connection(_) => CallFailure::Connection,
            RpcError::Timeout(_) => CallFailure::Timeout,
            _ => CallFailure::Local,
        };
        RpcError::Call {
            addr,
            kind,
            source: Box::new(err),
        }
    }

    /// Strips any `Call` wrapping and returns the underlying error.
    pub fn root_cause(&self) -> &RpcError {
        match self {
            RpcError::Call { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True when the peer closed the stream in the middle of (or before) a read.
    pub fn is_eof(&self) -> bool {
        matches!(self, RpcError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True for socket timeouts, including wrapped ones.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), RpcError::Timeout(_))
    }

    /// Class name reported to a remote caller when this error crosses the wire.
    pub fn remote_class(&self) -> &str {
        match self {
            RpcError::Remote { class, .. } => class,
            RpcError::Protocol(_) => "wirecall.ProtocolError",
            RpcError::InvalidArgument(_) => "wirecall.InvalidArgument",
            RpcError::VersionMismatch { .. } => "wirecall.VersionMismatch",
            _ => "wirecall.IOError",
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => RpcError::Timeout(Arc::new(err)),
            io::ErrorKind::ConnectionRefused => RpcError::Connection(Arc::new(err)),
            _ => RpcError::Io(Arc::new(err)),
        }
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidArgument(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
