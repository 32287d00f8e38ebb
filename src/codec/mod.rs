//! Value marshalling between native Rust values and the D-Bus type system.
//!
//! Two representations live here:
//!
//! - [`WireValue`]: the self-describing tree the transport hands us (and that
//!   we hand back to it). It keeps every D-Bus distinction: object paths vs.
//!   strings, typed arrays vs. arrays of variants, structs vs. arrays.
//! - [`Value`]: the normalized, dynamically-typed native form consumers work
//!   with. Variants are unwrapped, structs become lists, dictionary keys become
//!   strings, and anything that cannot be represented becomes [`Value::Invalid`].
//!
//! # Directions
//!
//! ```text
//! native T ──Marshall──> WireValue ──transport──> bus
//! bus ──transport──> WireValue ──demarshall──> Value
//!                             └──Demarshall──> native T
//! ```

mod demarshall;
mod flatten;
mod marshall;
mod signature;
mod typed;

pub use demarshall::{demarshall, demarshall_as, Demarshall};
pub use flatten::{flatten_variant_array_force_type, flatten_variant_array_guess_type};
pub use marshall::{marshall, marshall_value, AsVariant, IntoArguments, Marshall, ObjectPath, WireType};
pub use signature::{is_valid_signature, split_signature};
pub(crate) use signature::split_dict_signature;
pub use typed::{marshall_typed, TypedArg};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Maximum nesting depth accepted while demarshalling.
///
/// Matches the D-Bus protocol limit on container recursion, so valid
/// messages are never cut short.
pub const MAX_DEPTH: usize = 32;

/// Errors raised while building wire values for an outgoing call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid type specifier: {0}")]
    InvalidType(String),

    #[error("Invalid argument for type {0}: value is missing or invalid")]
    MissingValue(String),

    #[error("Invalid value for type specifier {type_code}: {value}")]
    Coercion { type_code: String, value: String },

    #[error("Type {0} cannot be sent by this runtime")]
    Unsupported(String),

    #[error("Invalid value cannot be marshalled")]
    InvalidValue,
}

/// A value as carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(i32),
    /// A raw byte buffer (`ay` as received from the transport).
    Bytes(Vec<u8>),
    /// A typed array. `element` is the element signature, e.g. `"s"` or `"v"`.
    Array {
        element: String,
        items: Vec<WireValue>,
    },
    /// Positional struct fields.
    Struct(Vec<WireValue>),
    /// A dictionary with its key and value signatures.
    Dict {
        key: String,
        value: String,
        entries: Vec<(WireValue, WireValue)>,
    },
    Variant(Box<WireValue>),
    /// A wire type the transport could not map (e.g. GVariant maybe types).
    Unsupported { signature: String },
}

impl WireValue {
    /// The leading type code of this value's signature.
    ///
    /// Unlike [`WireValue::signature`] this never recurses.
    pub fn type_code(&self) -> char {
        match self {
            WireValue::Byte(_) => 'y',
            WireValue::Bool(_) => 'b',
            WireValue::Int16(_) => 'n',
            WireValue::UInt16(_) => 'q',
            WireValue::Int32(_) => 'i',
            WireValue::UInt32(_) => 'u',
            WireValue::Int64(_) => 'x',
            WireValue::UInt64(_) => 't',
            WireValue::Double(_) => 'd',
            WireValue::String(_) => 's',
            WireValue::ObjectPath(_) => 'o',
            WireValue::Signature(_) => 'g',
            WireValue::UnixFd(_) => 'h',
            WireValue::Bytes(_) | WireValue::Array { .. } | WireValue::Dict { .. } => 'a',
            WireValue::Struct(_) => '(',
            WireValue::Variant(_) => 'v',
            WireValue::Unsupported { signature } => signature.chars().next().unwrap_or('?'),
        }
    }

    /// Full D-Bus signature of this value.
    pub fn signature(&self) -> String {
        match self {
            WireValue::Bytes(_) => "ay".to_string(),
            WireValue::Array { element, .. } => format!("a{}", element),
            WireValue::Struct(fields) => {
                let inner: String = fields.iter().map(WireValue::signature).collect();
                format!("({})", inner)
            }
            WireValue::Dict { key, value, .. } => format!("a{{{}{}}}", key, value),
            WireValue::Unsupported { signature } => signature.clone(),
            other => other.type_code().to_string(),
        }
    }

    /// Strip one variant layer, if present.
    pub fn into_inner_variant(self) -> WireValue {
        match self {
            WireValue::Variant(inner) => *inner,
            other => other,
        }
    }

    /// Borrowing form of [`WireValue::into_inner_variant`].
    pub fn unwrap_variant(&self) -> &WireValue {
        match self {
            WireValue::Variant(inner) => inner,
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) | WireValue::ObjectPath(s) | WireValue::Signature(s) => Some(s),
            _ => None,
        }
    }
}

/// Normalized native value.
///
/// This is the "any" type of the runtime: what consumers receive when they do
/// not ask for a specific Rust type, and what they pass when they want the
/// codec to pick a wire representation for them.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Placeholder for values that could not be decoded.
    #[default]
    Invalid,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            Value::UInt64(v) => Some(v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// String form used for dictionary keys.
    ///
    /// Scalars print themselves; containers and invalid values give an empty
    /// string.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Double(d) => d.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Invalid | Value::List(_) | Value::Map(_) => String::new(),
            other => other.as_i64().map(|v| v.to_string()).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<invalid>"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// JSON mapping used by the CLI's `TYPE:VALUE` arguments.
///
/// Integral numbers become `Int32` when they fit (JSON/JS integers are what
/// callers usually mean by "integer"), otherwise `Int64`/`UInt64`.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Invalid,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map(Value::Int32).unwrap_or(Value::Int64(i))
                } else if let Some(u) = n.as_u64() {
                    Value::UInt64(u)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}
