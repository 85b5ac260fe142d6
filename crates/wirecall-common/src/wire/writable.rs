use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use super::object::{DeclaredType, TypedValue, Value};
use super::registry::TypeRegistry;
use crate::protocol::error::{Result, RpcError};

/// A user type that knows how to serialize itself.
///
/// The codec writes the runtime [`type_name`](Writable::type_name) ahead of
/// the payload, and on the way back in instantiates the type through the
/// [`TypeRegistry`] before calling [`read_fields`](Writable::read_fields).
///
/// # Example
///
/// ```
/// use std::any::Any;
/// use std::io::{Read, Write};
/// use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
/// use wirecall_common::{Result, TypeRegistry, Writable};
///
/// #[derive(Debug, Default)]
/// struct Counter {
///     counter: i32,
///     timestamp: i64,
/// }
///
/// impl Writable for Counter {
///     fn type_name(&self) -> &str {
///         "example.Counter"
///     }
///
///     fn write(&self, out: &mut dyn Write) -> Result<()> {
///         out.write_i32::<BigEndian>(self.counter)?;
///         out.write_i64::<BigEndian>(self.timestamp)?;
///         Ok(())
///     }
///
///     fn read_fields(&mut self, input: &mut dyn Read, _types: &TypeRegistry) -> Result<()> {
///         self.counter = input.read_i32::<BigEndian>()?;
///         self.timestamp = input.read_i64::<BigEndian>()?;
///         Ok(())
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
/// ```
pub trait Writable: Any + Send + Sync + fmt::Debug {
    /// Concrete type name written on the wire; must match the registry entry.
    fn type_name(&self) -> &str;

    /// Serializes the fields of `self`.
    fn write(&self, out: &mut dyn Write) -> Result<()>;

    /// Overwrites the fields of `self` from `input`.
    ///
    /// `types` is available for fields that are themselves typed values.
    fn read_fields(&mut self, input: &mut dyn Read, types: &TypeRegistry) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Rust types with a fixed declared type on the wire.
///
/// Typed proxies use this to turn arguments into [`TypedValue`]s and the
/// decoded result back into the method's return type.
pub trait WireType: Sized {
    fn declared_type() -> DeclaredType;

    fn into_value(self) -> Value;

    fn from_value(value: Value) -> Result<Self>;

    fn into_typed(self) -> TypedValue {
        TypedValue::new(Self::declared_type(), self.into_value())
    }

    fn from_typed(typed: TypedValue) -> Result<Self> {
        Self::from_value(typed.value)
    }
}

fn mismatch(expected: &str, found: &Value) -> RpcError {
    RpcError::protocol(format!("expected {expected} value, found {found:?}"))
}

macro_rules! primitive_wire_type {
    ($ty:ty, $declared:ident) => {
        impl WireType for $ty {
            fn declared_type() -> DeclaredType {
                DeclaredType::$declared
            }

            fn into_value(self) -> Value {
                Value::$declared(self)
            }

            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$declared(v) => Ok(v),
                    other => Err(mismatch(stringify!($ty), &other)),
                }
            }
        }
    };
}

primitive_wire_type!(bool, Boolean);
primitive_wire_type!(i8, Byte);
primitive_wire_type!(u16, Char);
primitive_wire_type!(i16, Short);
primitive_wire_type!(i32, Int);
primitive_wire_type!(i64, Long);
primitive_wire_type!(f32, Float);
primitive_wire_type!(f64, Double);
primitive_wire_type!(String, String);

impl WireType for () {
    fn declared_type() -> DeclaredType {
        DeclaredType::Void
    }

    fn into_value(self) -> Value {
        Value::Void
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Void => Ok(()),
            other => Err(mismatch("void", &other)),
        }
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn declared_type() -> DeclaredType {
        DeclaredType::Array(Box::new(T::declared_type()))
    }

    fn into_value(self) -> Value {
        Value::Array(self.into_iter().map(WireType::into_value).collect())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("array", &other)),
        }
    }
}

/// Extracts a concrete writable out of a decoded value.
///
/// Handy for implementing [`WireType::from_value`] on user types.
pub fn downcast_writable<T: Writable + Clone>(value: &Value) -> Result<T> {
    match value {
        Value::Writable(instance) => instance
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| {
                RpcError::protocol(format!(
                    "unexpected writable type {}",
                    instance.type_name()
                ))
            }),
        other => Err(mismatch("writable", other)),
    }
}

/// Wraps a writable so it can travel as a [`Value`].
pub fn writable_value<T: Writable>(instance: T) -> Value {
    Value::Writable(Arc::new(instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_declared_types() {
        assert_eq!(i32::declared_type(), DeclaredType::Int);
        assert_eq!(<()>::declared_type(), DeclaredType::Void);
        assert_eq!(
            Vec::<Vec<f64>>::declared_type(),
            DeclaredType::Array(Box::new(DeclaredType::Array(Box::new(DeclaredType::Double))))
        );
    }

    #[test]
    fn test_into_typed_and_back() {
        let typed = vec![1i64, 2, 3].into_typed();
        assert_eq!(typed.declared.name(), "[J");
        assert_eq!(Vec::<i64>::from_typed(typed).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_from_value_mismatch() {
        let err = i32::from_value(Value::Long(1)).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
