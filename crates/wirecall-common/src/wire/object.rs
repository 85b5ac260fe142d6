//! Self-describing values.
//!
//! Every value is written as its declared type name followed by the payload,
//! so the reader can dispatch without any schema besides the names the
//! [`TypeRegistry`] knows about.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::registry::{TypeEntry, TypeRegistry};
use super::utf8::{read_string, write_string};
use super::writable::{WireType, Writable};
use crate::protocol::error::{Result, RpcError};

const STRING_TYPE: &str = "java.lang.String";

/// Deepest array nesting accepted in a type name read off the wire.
pub const MAX_ARRAY_DEPTH: usize = 255;

/// Static type of a value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    String,
    Array(Box<DeclaredType>),
    Enum(String),
    /// A writable type, or an interface a writable is declared as.
    Writable(String),
}

impl DeclaredType {
    /// Name written ahead of every payload.
    pub fn name(&self) -> String {
        match self {
            DeclaredType::Boolean => "boolean".to_string(),
            DeclaredType::Byte => "byte".to_string(),
            DeclaredType::Char => "char".to_string(),
            DeclaredType::Short => "short".to_string(),
            DeclaredType::Int => "int".to_string(),
            DeclaredType::Long => "long".to_string(),
            DeclaredType::Float => "float".to_string(),
            DeclaredType::Double => "double".to_string(),
            DeclaredType::Void => "void".to_string(),
            DeclaredType::String => STRING_TYPE.to_string(),
            DeclaredType::Array(component) => format!("[{}", component.descriptor()),
            DeclaredType::Enum(name) | DeclaredType::Writable(name) => name.clone(),
        }
    }

    /// Form used for array components, e.g. `I` or `Ljava.lang.String;`.
    pub fn descriptor(&self) -> String {
        match self {
            DeclaredType::Boolean => "Z".to_string(),
            DeclaredType::Byte => "B".to_string(),
            DeclaredType::Char => "C".to_string(),
            DeclaredType::Short => "S".to_string(),
            DeclaredType::Int => "I".to_string(),
            DeclaredType::Long => "J".to_string(),
            DeclaredType::Float => "F".to_string(),
            DeclaredType::Double => "D".to_string(),
            DeclaredType::Void => "V".to_string(),
            DeclaredType::Array(component) => format!("[{}", component.descriptor()),
            other => format!("L{};", other.name()),
        }
    }

    /// Resolves a name read off the wire.
    pub fn from_name(name: &str, types: &TypeRegistry) -> Result<Self> {
        let declared = match name {
            "boolean" => DeclaredType::Boolean,
            "byte" => DeclaredType::Byte,
            "char" => DeclaredType::Char,
            "short" => DeclaredType::Short,
            "int" => DeclaredType::Int,
            "long" => DeclaredType::Long,
            "float" => DeclaredType::Float,
            "double" => DeclaredType::Double,
            "void" => DeclaredType::Void,
            STRING_TYPE => DeclaredType::String,
            _ if name.starts_with('[') => parse_array(name, types)?,
            _ => match types.lookup(name) {
                Some(TypeEntry::Enum(_)) => DeclaredType::Enum(name.to_string()),
                Some(TypeEntry::Writable(_)) | Some(TypeEntry::Interface) => {
                    DeclaredType::Writable(name.to_string())
                }
                None => {
                    return Err(RpcError::protocol(format!(
                        "readObject can't find class {name}"
                    )))
                }
            },
        };
        Ok(declared)
    }
}

/// Parses `[[I`, `[Ljava.lang.String;` and the like.
///
/// The leading `[` run is counted rather than recursed into, and a component
/// class name may not itself be an array.
fn parse_array(name: &str, types: &TypeRegistry) -> Result<DeclaredType> {
    let descriptor = name.trim_start_matches('[');
    let depth = name.len() - descriptor.len();
    if depth > MAX_ARRAY_DEPTH {
        return Err(RpcError::protocol("array nesting too deep"));
    }

    let malformed = || RpcError::protocol(format!("malformed array type {name}"));
    let mut chars = descriptor.chars();
    let component = match chars.next() {
        Some('Z') => DeclaredType::Boolean,
        Some('B') => DeclaredType::Byte,
        Some('C') => DeclaredType::Char,
        Some('S') => DeclaredType::Short,
        Some('I') => DeclaredType::Int,
        Some('J') => DeclaredType::Long,
        Some('F') => DeclaredType::Float,
        Some('D') => DeclaredType::Double,
        Some('L') => {
            let rest = chars.as_str();
            let end = rest.find(';').ok_or_else(malformed)?;
            let class = &rest[..end];
            if class.is_empty() || class.starts_with('[') {
                return Err(malformed());
            }
            chars = rest[end + 1..].chars();
            DeclaredType::from_name(class, types)?
        }
        Some(other) => {
            return Err(RpcError::protocol(format!(
                "malformed array type: unknown component {other}"
            )))
        }
        None => return Err(RpcError::protocol("malformed array type: missing component")),
    };
    if !chars.as_str().is_empty() {
        return Err(malformed());
    }

    Ok((0..depth).fold(component, |inner, _| DeclaredType::Array(Box::new(inner))))
}

/// Runtime payload of a [`TypedValue`].
#[derive(Debug, Clone)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Void,
    String(String),
    Array(Vec<Value>),
    /// Enum constant name.
    Enum(String),
    Writable(Arc<dyn Writable>),
}

impl Value {
    /// Borrows the concrete writable inside, if it is a `T`.
    pub fn as_writable<T: Writable>(&self) -> Option<&T> {
        match self {
            Value::Writable(instance) => instance.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Void, Value::Void) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            // writables have no equality of their own; compare what they put on the wire
            (Value::Writable(a), Value::Writable(b)) => {
                let mut left: Vec<u8> = Vec::new();
                let mut right: Vec<u8> = Vec::new();
                a.type_name() == b.type_name()
                    && a.write(&mut left).is_ok()
                    && b.write(&mut right).is_ok()
                    && left == right
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Char(v) => match char::from_u32(u32::from(*v)) {
                Some(c) => write!(f, "{c:?}"),
                None => write!(f, "\\u{v:04x}"),
            },
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Void => f.write_str("void"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Enum(constant) => f.write_str(constant),
            Value::Writable(instance) => write!(f, "{instance:?}"),
        }
    }
}

/// A value together with the type it is declared as.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub declared: DeclaredType,
    pub value: Value,
}

impl TypedValue {
    pub fn new(declared: DeclaredType, value: Value) -> Self {
        Self { declared, value }
    }

    pub fn of<T: WireType>(value: T) -> Self {
        value.into_typed()
    }

    pub fn void() -> Self {
        Self::new(DeclaredType::Void, Value::Void)
    }

    /// A writable declared as `declared`, which may be an interface name.
    pub fn writable<T: Writable>(declared: impl Into<String>, instance: T) -> Self {
        Self::new(
            DeclaredType::Writable(declared.into()),
            Value::Writable(Arc::new(instance)),
        )
    }

    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        write_object(out, &self.value, &self.declared)
    }

    pub fn read_from(input: &mut dyn Read, types: &TypeRegistry) -> Result<Self> {
        read_object(input, types)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8], types: &TypeRegistry) -> Result<Self> {
        let mut input = bytes;
        read_object(&mut input, types)
    }

    /// Converts into a Rust value, failing if the payload has another shape.
    pub fn into_wire<T: WireType>(self) -> Result<T> {
        T::from_typed(self)
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Writes `value` as an instance of `declared`.
pub fn write_object(out: &mut dyn Write, value: &Value, declared: &DeclaredType) -> Result<()> {
    write_string(out, &declared.name())?;

    match (declared, value) {
        (DeclaredType::Boolean, Value::Boolean(v)) => out.write_u8(u8::from(*v))?,
        (DeclaredType::Byte, Value::Byte(v)) => out.write_i8(*v)?,
        (DeclaredType::Char, Value::Char(v)) => out.write_u16::<BigEndian>(*v)?,
        (DeclaredType::Short, Value::Short(v)) => out.write_i16::<BigEndian>(*v)?,
        (DeclaredType::Int, Value::Int(v)) => out.write_i32::<BigEndian>(*v)?,
        (DeclaredType::Long, Value::Long(v)) => out.write_i64::<BigEndian>(*v)?,
        (DeclaredType::Float, Value::Float(v)) => out.write_f32::<BigEndian>(*v)?,
        (DeclaredType::Double, Value::Double(v)) => out.write_f64::<BigEndian>(*v)?,
        (DeclaredType::Void, Value::Void) => {}
        (DeclaredType::String, Value::String(s)) => {
            write_string(out, s)?;
        }
        (DeclaredType::Array(component), Value::Array(items)) => {
            let len = i32::try_from(items.len())
                .map_err(|_| RpcError::InvalidArgument("array too long".to_string()))?;
            out.write_i32::<BigEndian>(len)?;
            for item in items {
                write_object(out, item, component)?;
            }
        }
        (DeclaredType::Enum(_), Value::Enum(constant)) => {
            write_string(out, constant)?;
        }
        (DeclaredType::Writable(_), Value::Writable(instance)) => {
            write_string(out, instance.type_name())?;
            instance.write(out)?;
        }
        _ => {
            return Err(RpcError::InvalidArgument(format!(
                "Can't write: {value} as {}",
                declared.name()
            )))
        }
    }
    Ok(())
}

/// Reads one value written by [`write_object`].
pub fn read_object(input: &mut dyn Read, types: &TypeRegistry) -> Result<TypedValue> {
    let name = read_string(input)?;
    let declared = DeclaredType::from_name(&name, types)?;
    let value = read_value(input, &declared, types)?;
    Ok(TypedValue::new(declared, value))
}

fn read_value(input: &mut dyn Read, declared: &DeclaredType, types: &TypeRegistry) -> Result<Value> {
    let value = match declared {
        DeclaredType::Boolean => Value::Boolean(input.read_u8()? != 0),
        DeclaredType::Byte => Value::Byte(input.read_i8()?),
        DeclaredType::Char => Value::Char(input.read_u16::<BigEndian>()?),
        DeclaredType::Short => Value::Short(input.read_i16::<BigEndian>()?),
        DeclaredType::Int => Value::Int(input.read_i32::<BigEndian>()?),
        DeclaredType::Long => Value::Long(input.read_i64::<BigEndian>()?),
        DeclaredType::Float => Value::Float(input.read_f32::<BigEndian>()?),
        DeclaredType::Double => Value::Double(input.read_f64::<BigEndian>()?),
        DeclaredType::Void => Value::Void,
        DeclaredType::String => Value::String(read_string(input)?),
        DeclaredType::Array(component) => {
            let len = input.read_i32::<BigEndian>()?;
            if len < 0 {
                return Err(RpcError::protocol(format!("negative array length {len}")));
            }
            // the count is untrusted; let the vector grow past this if needed
            let mut items = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                // checked before the payload so nesting stays within the array's own depth
                let element = DeclaredType::from_name(&read_string(input)?, types)?;
                if element != **component {
                    return Err(RpcError::protocol(format!(
                        "array element of type {} in {}",
                        element.name(),
                        declared.name()
                    )));
                }
                items.push(read_value(input, component, types)?);
            }
            Value::Array(items)
        }
        DeclaredType::Enum(name) => {
            let constant = read_string(input)?;
            types.check_enum_constant(name, &constant)?;
            Value::Enum(constant)
        }
        DeclaredType::Writable(_) => {
            let runtime = read_string(input)?;
            let mut instance = types.new_instance(&runtime)?;
            instance.read_fields(input, types)?;
            Value::Writable(Arc::from(instance))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Point {
        x: i32,
        label: String,
    }

    impl Writable for Point {
        fn type_name(&self) -> &str {
            "test.Point"
        }

        fn write(&self, out: &mut dyn Write) -> Result<()> {
            out.write_i32::<BigEndian>(self.x)?;
            write_string(out, &self.label)?;
            Ok(())
        }

        fn read_fields(&mut self, input: &mut dyn Read, _types: &TypeRegistry) -> Result<()> {
            self.x = input.read_i32::<BigEndian>()?;
            self.label = read_string(input)?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
            .with_writable::<Point>("test.Point")
            .with_interface("test.Shape")
            .with_enum("test.Color", ["RED", "GREEN", "BLUE"])
    }

    fn round_trip(typed: &TypedValue) -> TypedValue {
        let bytes = typed.to_bytes().unwrap();
        TypedValue::from_bytes(&bytes, &registry()).unwrap()
    }

    #[test]
    fn test_int_layout() {
        let bytes = TypedValue::of(7i32).to_bytes().unwrap();
        assert_eq!(bytes, vec![0, 3, b'i', b'n', b't', 0, 0, 0, 7]);
    }

    #[test]
    fn test_primitives_round_trip() {
        let values = vec![
            TypedValue::of(true),
            TypedValue::of(-3i8),
            TypedValue::of(0x263Au16),
            TypedValue::of(-300i16),
            TypedValue::of(i32::MAX),
            TypedValue::of(i64::MIN),
            TypedValue::of(3.25f32),
            TypedValue::of(-1e300f64),
            TypedValue::void(),
        ];
        for typed in values {
            assert_eq!(round_trip(&typed), typed);
        }
    }

    #[test]
    fn test_array_names() {
        assert_eq!(Vec::<i32>::declared_type().name(), "[I");
        assert_eq!(Vec::<String>::declared_type().name(), "[Ljava.lang.String;");
        assert_eq!(Vec::<Vec<i64>>::declared_type().name(), "[[J");
        assert_eq!(
            DeclaredType::from_name("[[J", &registry()).unwrap(),
            Vec::<Vec<i64>>::declared_type()
        );
        assert_eq!(
            DeclaredType::from_name("[Ltest.Color;", &registry()).unwrap(),
            DeclaredType::Array(Box::new(DeclaredType::Enum("test.Color".to_string())))
        );
    }

    #[test]
    fn test_arrays_round_trip() {
        let ints = TypedValue::of(vec![1i32, 2, 3]);
        assert_eq!(round_trip(&ints), ints);

        let nested = TypedValue::of(vec![vec!["a".to_string()], vec![], vec!["b".into(), "c".into()]]);
        assert_eq!(round_trip(&nested), nested);

        let empty = TypedValue::of(Vec::<f64>::new());
        assert_eq!(round_trip(&empty), empty);
    }

    #[test]
    fn test_string_round_trip_and_truncation() {
        let short = TypedValue::of("hello wörld".to_string());
        assert_eq!(round_trip(&short), short);

        let long = "x".repeat(30_000);
        let decoded = round_trip(&TypedValue::of(long.clone()));
        assert_eq!(decoded.declared, DeclaredType::String);
        assert_eq!(
            decoded.into_wire::<String>().unwrap(),
            long[..super::super::utf8::MAX_STRING_CHARS]
        );
    }

    #[test]
    fn test_enum_round_trip() {
        let typed = TypedValue::new(
            DeclaredType::Enum("test.Color".to_string()),
            Value::Enum("GREEN".to_string()),
        );
        assert_eq!(round_trip(&typed), typed);
    }

    #[test]
    fn test_unknown_enum_constant() {
        let typed = TypedValue::new(
            DeclaredType::Enum("test.Color".to_string()),
            Value::Enum("PURPLE".to_string()),
        );
        let bytes = typed.to_bytes().unwrap();
        let err = TypedValue::from_bytes(&bytes, &registry()).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_writable_round_trip() {
        let point = Point {
            x: 42,
            label: "origin".to_string(),
        };
        let typed = TypedValue::writable("test.Point", point.clone());
        let decoded = round_trip(&typed);
        assert_eq!(decoded, typed);
        assert_eq!(decoded.value.as_writable::<Point>(), Some(&point));
    }

    #[test]
    fn test_writable_declared_as_interface() {
        let typed = TypedValue::writable("test.Shape", Point::default());
        let bytes = typed.to_bytes().unwrap();

        // declared name, then the runtime name
        let mut input = bytes.as_slice();
        assert_eq!(read_string(&mut input).unwrap(), "test.Shape");
        assert_eq!(read_string(&mut input).unwrap(), "test.Point");

        let decoded = TypedValue::from_bytes(&bytes, &registry()).unwrap();
        assert_eq!(decoded.declared, DeclaredType::Writable("test.Shape".to_string()));
        assert!(decoded.value.as_writable::<Point>().is_some());
    }

    #[test]
    fn test_unknown_type_name() {
        let mut bytes: Vec<u8> = Vec::new();
        write_string(&mut bytes, "test.Missing").unwrap();
        let err = TypedValue::from_bytes(&bytes, &registry()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Protocol error: readObject can't find class test.Missing"
        );
    }

    #[test]
    fn test_truncated_stream_is_eof() {
        let bytes = TypedValue::of(vec![1i64, 2, 3]).to_bytes().unwrap();
        let err = TypedValue::from_bytes(&bytes[..bytes.len() - 3], &registry()).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_negative_array_length() {
        let mut bytes: Vec<u8> = Vec::new();
        write_string(&mut bytes, "[I").unwrap();
        bytes.write_i32::<BigEndian>(-1).unwrap();
        let err = TypedValue::from_bytes(&bytes, &registry()).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_array_nesting_limit() {
        let deepest = format!("{}I", "[".repeat(MAX_ARRAY_DEPTH));
        let declared = DeclaredType::from_name(&deepest, &registry()).unwrap();
        assert_eq!(declared.name(), deepest);

        let err = DeclaredType::from_name(&format!("[{deepest}"), &registry()).unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: array nesting too deep");
    }

    #[test]
    fn test_huge_array_nesting_on_the_wire() {
        let mut bytes: Vec<u8> = Vec::new();
        write_string(&mut bytes, &format!("{}I", "[".repeat(60_000))).unwrap();
        bytes.write_i32::<BigEndian>(0).unwrap();
        let err = TypedValue::from_bytes(&bytes, &registry()).unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: array nesting too deep");
    }

    #[test]
    fn test_malformed_array_names() {
        for name in ["[", "[Q", "[Ltest.Point", "[Ltest.Point;I", "[L;", "[L[I;", "[II"] {
            let err = DeclaredType::from_name(name, &registry()).unwrap_err();
            assert!(matches!(err, RpcError::Protocol(_)), "{name}: {err}");
        }
    }

    #[test]
    fn test_array_element_type_checked_before_payload() {
        // [[I holding an element that claims to be [[I itself
        let mut bytes: Vec<u8> = Vec::new();
        write_string(&mut bytes, "[[I").unwrap();
        bytes.write_i32::<BigEndian>(1).unwrap();
        write_string(&mut bytes, "[[I").unwrap();
        let err = TypedValue::from_bytes(&bytes, &registry()).unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: array element of type [[I in [[I");
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let typed = TypedValue::new(DeclaredType::Int, Value::String("nope".to_string()));
        let err = typed.to_bytes().unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }
}
