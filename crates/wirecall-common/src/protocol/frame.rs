//! Connection header and call frames.
//!
//! Frame bodies produced here are length-prefixed by the transport codec.
//!
//! ```text
//! request:  [call id: i32] [Invocation]
//! ping:     [-1: i32]
//! response: [call id: i32] [status: u8] [TypedValue | error class, message]
//! ```

use std::io::Write;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::invocation::Invocation;
use crate::wire::{read_string, write_string, TypeRegistry, TypedValue};

/// Magic bytes opening every connection.
pub const HEADER: &[u8; 4] = b"hrpc";

/// Wire version sent right after the magic bytes.
pub const CURRENT_VERSION: u8 = 3;

/// Call id reserved for ping frames.
pub const PING_CALL_ID: CallId = -1;

pub type CallId = i32;

const STATUS_SUCCESS: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Sent once per connection, after the magic and version, naming the
/// protocol every later call on the connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHeader {
    protocol: String,
}

impl ConnectionHeader {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        write_string(&mut out, &self.protocol)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let protocol = read_string(&mut input)?;
        Ok(Self { protocol })
    }
}

/// A decoded client-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFrame {
    Ping,
    Call {
        call_id: CallId,
        invocation: Invocation,
    },
}

impl RequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            RequestFrame::Ping => Ok(encode_ping()),
            RequestFrame::Call {
                call_id,
                invocation,
            } => encode_call(*call_id, invocation),
        }
    }

    pub fn decode(body: &[u8], types: &TypeRegistry) -> Result<Self> {
        let mut input = body;
        let call_id = input.read_i32::<BigEndian>()?;
        if call_id == PING_CALL_ID {
            return Ok(RequestFrame::Ping);
        }
        let invocation = Invocation::read(&mut input, types)?;
        Ok(RequestFrame::Call {
            call_id,
            invocation,
        })
    }
}

/// Encodes a request body without taking ownership of the invocation.
pub fn encode_call(call_id: CallId, invocation: &Invocation) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    out.write_i32::<BigEndian>(call_id)?;
    invocation.write(&mut out)?;
    Ok(out)
}

pub fn encode_ping() -> Vec<u8> {
    PING_CALL_ID.to_be_bytes().to_vec()
}

/// Reads the call id off the front of a frame body, if there is one.
///
/// Lets a server answer a call whose parameters failed to decode.
pub fn peek_call_id(body: &[u8]) -> Option<CallId> {
    let mut input = body;
    input.read_i32::<BigEndian>().ok()
}

/// Outcome of one call as carried back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(TypedValue),
    Error { class: String, message: String },
}

impl Response {
    pub fn from_result(result: Result<TypedValue>) -> Self {
        match result {
            Ok(value) => Response::Value(value),
            Err(RpcError::Remote { class, message }) => Response::Error { class, message },
            Err(e) => Response::Error {
                class: e.remote_class().to_string(),
                message: e.to_string(),
            },
        }
    }

    /// Turns an error response into [`RpcError::Remote`].
    pub fn into_result(self) -> Result<TypedValue> {
        match self {
            Response::Value(value) => Ok(value),
            Response::Error { class, message } => Err(RpcError::Remote { class, message }),
        }
    }
}

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub call_id: CallId,
    pub response: Response,
}

impl ResponseFrame {
    pub fn new(call_id: CallId, response: Response) -> Self {
        Self { call_id, response }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        out.write_i32::<BigEndian>(self.call_id)?;
        match &self.response {
            Response::Value(value) => {
                out.write_u8(STATUS_SUCCESS)?;
                value.write_to(&mut out)?;
            }
            Response::Error { class, message } => {
                out.write_u8(STATUS_ERROR)?;
                write_string(&mut out, class)?;
                write_string(&mut out, message)?;
            }
        }
        Ok(out)
    }

    pub fn decode(body: &[u8], types: &TypeRegistry) -> Result<Self> {
        let mut input: &[u8] = body;
        let call_id = input.read_i32::<BigEndian>()?;
        let response = match input.read_u8()? {
            STATUS_SUCCESS => Response::Value(TypedValue::read_from(&mut input, types)?),
            STATUS_ERROR => {
                let class = read_string(&mut input)?;
                let message = read_string(&mut input)?;
                Response::Error { class, message }
            }
            other => {
                return Err(RpcError::protocol(format!(
                    "unknown response status {other} for call {call_id}"
                )))
            }
        };
        Ok(Self { call_id, response })
    }
}

/// Fails unless `version` is the wire version this crate speaks.
pub fn check_version(version: u8) -> Result<()> {
    if version != CURRENT_VERSION {
        return Err(RpcError::protocol(format!(
            "unsupported wire version {version} (expected {CURRENT_VERSION})"
        )));
    }
    Ok(())
}
