use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::writable::Writable;
use crate::protocol::error::{Result, RpcError};

type Factory = Arc<dyn Fn() -> Box<dyn Writable> + Send + Sync>;

/// What a registered type name resolves to.
#[derive(Clone)]
pub enum TypeEntry {
    /// Enum with its constant names.
    Enum(Vec<String>),
    /// Writable with a zero-argument factory.
    Writable(Factory),
    /// Protocol interface name; only useful as a declared type.
    Interface,
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeEntry::Enum(constants) => f.debug_tuple("Enum").field(constants).finish(),
            TypeEntry::Writable(_) => f.write_str("Writable(..)"),
            TypeEntry::Interface => f.write_str("Interface"),
        }
    }
}

/// Resolves type names read off the wire into something we can build.
///
/// Both peers must register the same names for user types; primitive,
/// string and array names are understood without registration.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entries: HashMap<String, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name` using its `Default` impl as the factory.
    pub fn with_writable<T: Writable + Default>(self, name: impl Into<String>) -> Self {
        self.with_writable_factory(name, || Box::new(T::default()))
    }

    pub fn with_writable_factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Writable> + Send + Sync + 'static,
    {
        self.entries
            .insert(name.into(), TypeEntry::Writable(Arc::new(factory)));
        self
    }

    pub fn with_enum<I, S>(mut self, name: impl Into<String>, constants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let constants = constants.into_iter().map(Into::into).collect();
        self.entries.insert(name.into(), TypeEntry::Enum(constants));
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), TypeEntry::Interface);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&TypeEntry> {
        self.entries.get(name)
    }

    /// Builds a fresh, unpopulated instance of the writable named `name`.
    pub fn new_instance(&self, name: &str) -> Result<Box<dyn Writable>> {
        match self.entries.get(name) {
            Some(TypeEntry::Writable(factory)) => Ok(factory()),
            Some(_) => Err(RpcError::protocol(format!("{name} is not a writable type"))),
            None => Err(RpcError::protocol(format!(
                "readObject can't find class {name}"
            ))),
        }
    }

    /// Fails unless `constant` is a member of the enum `name`.
    pub fn check_enum_constant(&self, name: &str, constant: &str) -> Result<()> {
        match self.entries.get(name) {
            Some(TypeEntry::Enum(constants)) if constants.iter().any(|c| c == constant) => Ok(()),
            Some(TypeEntry::Enum(_)) => Err(RpcError::protocol(format!(
                "No enum constant {name}.{constant}"
            ))),
            _ => Err(RpcError::protocol(format!("{name} is not an enum type"))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error::Result;
    use std::any::Any;
    use std::io::{Read, Write};

    #[derive(Debug, Default)]
    struct Empty;

    impl Writable for Empty {
        fn type_name(&self) -> &str {
            "test.Empty"
        }

        fn write(&self, _out: &mut dyn Write) -> Result<()> {
            Ok(())
        }

        fn read_fields(&mut self, _input: &mut dyn Read, _types: &TypeRegistry) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_new_instance() {
        let types = TypeRegistry::new().with_writable::<Empty>("test.Empty");
        let instance = types.new_instance("test.Empty").unwrap();
        assert_eq!(instance.type_name(), "test.Empty");
    }

    #[test]
    fn test_unknown_class() {
        let err = TypeRegistry::new().new_instance("test.Missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Protocol error: readObject can't find class test.Missing"
        );
    }

    #[test]
    fn test_enum_constants() {
        let types = TypeRegistry::new().with_enum("test.Color", ["RED", "GREEN"]);
        assert!(types.check_enum_constant("test.Color", "RED").is_ok());
        assert!(types.check_enum_constant("test.Color", "BLUE").is_err());
        assert!(types.check_enum_constant("test.Shape", "RED").is_err());
    }
}
