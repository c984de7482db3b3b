//! Transferable values.
//!
//! The wire codec moves a closed set of value types between peers. The
//! [`IntoValue`] / [`TryFromValue`] pair maps application types onto that
//! set, including the numeric widenings a caller would expect at an RPC
//! boundary. Conversions are explicit trait impls rather than a runtime
//! registry, so an unsupported mapping is a compile error, not a wire
//! fault.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// A value the wire codec can carry directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    String(String),
    Bytes(Bytes),
    Uuid(Uuid),
    List(Vec<Value>),
    /// Order-preserving key/value pairs. Kept as a pair list so encode
    /// and decode are bit-exact and float-bearing keys need no ordering.
    Map(Vec<(Value, Value)>),
    /// A named product type. `schema` identifies the shape to the
    /// application-level binding; the engine treats it as opaque.
    Tuple { schema: String, elements: Vec<Value> },
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tuple { .. } => "tuple",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{:?}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "[{} bytes]", v.len()),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::List(v) => write!(f, "[{} elements]", v.len()),
            Value::Map(v) => write!(f, "{{{} entries}}", v.len()),
            Value::Tuple { schema, elements } => {
                write!(f, "{}({} elements)", schema, elements.len())
            }
        }
    }
}

/// Failure to map a [`Value`] onto a declared parameter type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl ConversionError {
    fn new(expected: &'static str, value: &Value) -> Self {
        ConversionError {
            expected,
            found: value.type_name(),
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot convert {} to {}", self.found, self.expected)
    }
}

impl std::error::Error for ConversionError {}

/// Application type → transferable value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Transferable value → application type, with widening.
pub trait TryFromValue: Sized {
    fn try_from_value(value: Value) -> Result<Self, ConversionError>;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl TryFromValue for Value {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl TryFromValue for () {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(()),
            other => Err(ConversionError::new("null", &other)),
        }
    }
}

macro_rules! into_value_direct {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        })*
    };
}

into_value_direct! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    char => Char,
    String => String,
    Uuid => Uuid,
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoValue for Bytes {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::Bytes(Bytes::copy_from_slice(self))
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

impl TryFromValue for bool {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(ConversionError::new("bool", &other)),
        }
    }
}

impl TryFromValue for i8 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::I8(v) => Ok(v),
            other => Err(ConversionError::new("i8", &other)),
        }
    }
}

impl TryFromValue for i16 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::I8(v) => Ok(v as i16),
            Value::I16(v) => Ok(v),
            other => Err(ConversionError::new("i16", &other)),
        }
    }
}

impl TryFromValue for i32 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::I8(v) => Ok(v as i32),
            Value::I16(v) => Ok(v as i32),
            Value::I32(v) => Ok(v),
            other => Err(ConversionError::new("i32", &other)),
        }
    }
}

impl TryFromValue for i64 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::I8(v) => Ok(v as i64),
            Value::I16(v) => Ok(v as i64),
            Value::I32(v) => Ok(v as i64),
            Value::I64(v) => Ok(v),
            other => Err(ConversionError::new("i64", &other)),
        }
    }
}

impl TryFromValue for f32 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::F32(v) => Ok(v),
            Value::I8(v) => Ok(v as f32),
            Value::I16(v) => Ok(v as f32),
            other => Err(ConversionError::new("f32", &other)),
        }
    }
}

impl TryFromValue for f64 {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::F32(v) => Ok(v as f64),
            Value::F64(v) => Ok(v),
            Value::I8(v) => Ok(v as f64),
            Value::I16(v) => Ok(v as f64),
            Value::I32(v) => Ok(v as f64),
            other => Err(ConversionError::new("f64", &other)),
        }
    }
}

impl TryFromValue for char {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Char(v) => Ok(v),
            other => Err(ConversionError::new("char", &other)),
        }
    }
}

impl TryFromValue for String {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::String(v) => Ok(v),
            Value::Char(v) => Ok(v.to_string()),
            other => Err(ConversionError::new("string", &other)),
        }
    }
}

impl TryFromValue for Bytes {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Bytes(v) => Ok(v),
            other => Err(ConversionError::new("bytes", &other)),
        }
    }
}

impl TryFromValue for Uuid {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Uuid(v) => Ok(v),
            other => Err(ConversionError::new("uuid", &other)),
        }
    }
}

impl<T: TryFromValue> TryFromValue for Vec<T> {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::List(items) => items.into_iter().map(T::try_from_value).collect(),
            other => Err(ConversionError::new("list", &other)),
        }
    }
}

impl<T: TryFromValue> TryFromValue for Option<T> {
    fn try_from_value(value: Value) -> Result<Self, ConversionError> {
        match value {
            Value::Null => Ok(None),
            other => T::try_from_value(other).map(Some),
        }
    }
}
