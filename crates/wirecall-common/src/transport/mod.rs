//! Transport Layer
//!
//! This module moves frames between clients and servers over TCP.
//!
//! # Components
//!
//! - **[`codec`]**: length-prefixed frames and the connection handshake
//! - **[`SocketFactory`]** / **[`StandardSocketFactory`]**: how clients open sockets
//! - **[`RpcServer`]**: async server dispatching decoded calls to a handler
//!
//! # Message Size Limits
//!
//! Frames larger than 100 MB are rejected in both directions.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{read_frame, read_handshake, write_frame, write_handshake, MAX_FRAME_SIZE};
pub use tcp::{resolve_addr, SocketFactory, StandardSocketFactory};
pub use tcp_server::{RpcServer, ServerCall};
