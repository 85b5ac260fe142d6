pub mod error;
pub mod frame;
pub mod invocation;

#[cfg(test)]
mod tests;

pub use error::{CallFailure, Result, RpcError};
pub use frame::{
    encode_call, encode_ping, peek_call_id, CallId, ConnectionHeader, RequestFrame, Response,
    ResponseFrame, CURRENT_VERSION, HEADER, PING_CALL_ID,
};
pub use invocation::Invocation;
