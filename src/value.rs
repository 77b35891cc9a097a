//! Dynamically-typed values extracted from documents, and range bounds.
//!
//! Documents are schemaless, so everything the index layer touches is a
//! [`Value`]: field-path queries yield them, index specifications derive
//! them, and range bounds are built from them. The variants mirror what
//! the msgpack wire format can carry plus a dedicated timestamp.

/// A value extracted from an encoded document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Unix timestamp: whole seconds and subsecond nanoseconds.
    Time { secs: i64, nanos: u32 },
    /// Heterogeneous sequence; also the representation of compound
    /// index tuples.
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Builds the ordered tuple used to bound compound index ranges.
    pub fn tuple(values: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(values.into_iter().collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            Value::F32(v) => Some(f64::from(v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<(i64, u32)> {
        match *self {
            Value::Time { secs, nanos } => Some((secs, nanos)),
            _ => None,
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Int(v as i64)
            }
        }
    )*};
}

macro_rules! value_from_uint {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::UInt(v as u64)
            }
        }
    )*};
}

value_from_int!(i8, i16, i32, i64);
value_from_uint!(u8, u16, u32, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Bytes(v.to_vec())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}

/// A bound for `between` range queries.
///
/// [`Bound::Min`] sorts before every real value and [`Bound::Max`] after
/// every real value, so `between(Bound::Min, Bound::Max)` spans the whole
/// table or index.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Min,
    Max,
    Value(Value),
}

macro_rules! bound_from {
    ($($t:ty),*) => {$(
        impl From<$t> for Bound {
            fn from(v: $t) -> Bound {
                Bound::Value(v.into())
            }
        }
    )*};
}

bound_from!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, &str, String, Vec<Value>);

impl From<Value> for Bound {
    fn from(v: Value) -> Bound {
        Bound::Value(v)
    }
}
