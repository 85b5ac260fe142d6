//! wirecall Common Types and Transport
//!
//! This crate provides the value codec, call framing and TCP transport shared
//! by wirecall clients and servers.
//!
//! # Overview
//!
//! - **Wire Layer**: self-describing values ([`TypedValue`]) built from
//!   big-endian primitives and length-prefixed strings, with the
//!   [`Writable`] extension point for user types
//! - **Protocol Layer**: [`Invocation`]s, call/response frames, the
//!   connection header and the [`RpcError`] taxonomy
//! - **Transport Layer**: async framing, socket factories and a reference
//!   [`RpcServer`](transport::RpcServer)
//!
//! # Architecture
//!
//! - **Transport**: TCP, one long-lived connection per (address, protocol)
//! - **Handshake**: `"hrpc"` + version byte + length-prefixed connection header
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [frame body]`
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use wirecall_common::{Invocation, TypeRegistry, TypedValue};
//!
//! let invocation = Invocation::new("add", vec![TypedValue::of(2i32), TypedValue::of(3i32)]);
//!
//! let mut bytes: Vec<u8> = Vec::new();
//! invocation.write(&mut bytes).unwrap();
//!
//! let decoded = Invocation::read(&mut bytes.as_slice(), &TypeRegistry::new()).unwrap();
//! assert_eq!(decoded, invocation);
//! ```

pub mod protocol;
pub mod transport;
pub mod wire;

pub use protocol::{CallFailure, CallId, Invocation, Result, RpcError};
pub use wire::{DeclaredType, TypeRegistry, TypedValue, Value, WireType, Writable};
