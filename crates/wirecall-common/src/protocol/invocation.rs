use std::fmt;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::protocol::error::{Result, RpcError};
use crate::wire::{read_object, read_string, write_string};
use crate::wire::{DeclaredType, TypeRegistry, TypedValue};

/// A method call captured for transmission.
///
/// Carries the method name and one [`TypedValue`] per parameter, so each
/// argument travels with its declared type. Built once per proxy call and
/// never mutated afterwards.
///
/// # Wire Format
///
/// ```text
/// [method name: string] [parameter count: i32] [TypedValue]*
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    method_name: String,
    parameters: Vec<TypedValue>,
}

impl Invocation {
    pub fn new(method_name: impl Into<String>, parameters: Vec<TypedValue>) -> Self {
        Self {
            method_name: method_name.into(),
            parameters,
        }
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameters(&self) -> &[TypedValue] {
        &self.parameters
    }

    /// Declared type of every parameter, in order.
    pub fn param_types(&self) -> Vec<&DeclaredType> {
        self.parameters.iter().map(|p| &p.declared).collect()
    }

    pub fn into_parameters(self) -> Vec<TypedValue> {
        self.parameters
    }

    pub fn write(&self, out: &mut dyn Write) -> Result<()> {
        write_string(out, &self.method_name)?;
        let count = i32::try_from(self.parameters.len())
            .map_err(|_| RpcError::InvalidArgument("too many parameters".to_string()))?;
        out.write_i32::<BigEndian>(count)?;
        for param in &self.parameters {
            param.write_to(out)?;
        }
        Ok(())
    }

    pub fn read(input: &mut dyn Read, types: &TypeRegistry) -> Result<Self> {
        let method_name = read_string(input)?;
        let count = input.read_i32::<BigEndian>()?;
        if count < 0 {
            return Err(RpcError::protocol(format!(
                "negative parameter count {count} for {method_name}"
            )));
        }
        let mut parameters = Vec::with_capacity((count as usize).min(64));
        for _ in 0..count {
            parameters.push(read_object(input, types)?);
        }
        Ok(Self {
            method_name,
            parameters,
        })
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method_name)?;
        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")
    }
}
