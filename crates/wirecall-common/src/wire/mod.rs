//! Binary value codec shared by clients and servers.

pub mod object;
pub mod registry;
pub mod utf8;
pub mod writable;

pub use object::{read_object, write_object, DeclaredType, TypedValue, Value};
pub use registry::{TypeEntry, TypeRegistry};
pub use utf8::{read_string, write_string, MAX_STRING_CHARS};
pub use writable::{downcast_writable, writable_value, WireType, Writable};
