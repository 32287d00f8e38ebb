//! Explicitly typed arguments.
//!
//! A typed argument pairs a D-Bus type specifier with a dynamic value, for
//! callers that need a wire type the dynamic mapping would not pick (an
//! unsigned integer, an object path, a typed array, ...).

use super::flatten::{coerce_scalar, FORCEABLE_CODES};
use super::{flatten_variant_array_force_type, marshall_value, CodecError, Value, WireValue};

/// A `{type, value}` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArg {
    pub type_code: String,
    pub value: Value,
}

impl TypedArg {
    pub fn new(type_code: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            type_code: type_code.into(),
            value: value.into(),
        }
    }

    /// Parse the command-line form `TYPE:VALUE`.
    ///
    /// `v` and array types take JSON. `s`, `o` and `g` take the text as-is.
    /// Other scalars take JSON, falling back to the raw text.
    pub fn parse(arg: &str) -> Result<Self, CodecError> {
        let (type_code, raw) = arg
            .split_once(':')
            .ok_or_else(|| CodecError::InvalidType(arg.to_string()))?;

        let value = match type_code {
            "s" | "o" | "g" => Value::String(raw.to_string()),
            t if t == "v" || t.starts_with('a') => serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::from)
                .map_err(|_| CodecError::Coercion {
                    type_code: t.to_string(),
                    value: raw.to_string(),
                })?,
            _ => serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        };

        Ok(Self::new(type_code, value))
    }
}

/// Build the wire value for a typed argument.
///
/// Accepted specifiers: the scalars `y q u t n i x b d s o g`, `v` (dynamic
/// mapping, wrapped in a variant), `aX` for a scalar `X` among
/// `b y q u t n i x d s`, and `a{sv}` (which requires a map).
pub fn marshall_typed(arg: &TypedArg) -> Result<WireValue, CodecError> {
    let type_code = arg.type_code.as_str();
    let value = &arg.value;

    if !value.is_valid() {
        return Err(CodecError::MissingValue(type_code.to_string()));
    }

    let coercion_error = || CodecError::Coercion {
        type_code: type_code.to_string(),
        value: value.to_string(),
    };

    let mut chars = type_code.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('h'), None, _) => Err(CodecError::Unsupported(type_code.to_string())),
        (Some('v'), None, _) => Ok(WireValue::Variant(Box::new(marshall_value(value)?))),
        (Some(code), None, _) if "yqutnixbdsog".contains(code) => {
            coerce_scalar(value, code).ok_or_else(coercion_error)
        }
        (Some('a'), Some(code), None) if FORCEABLE_CODES.contains(code) => {
            if value.as_list().is_none() {
                return Err(coercion_error());
            }
            let mut array = marshall_value(value)?;
            if flatten_variant_array_force_type(&mut array, code) {
                Ok(array)
            } else {
                Err(coercion_error())
            }
        }
        _ if type_code == "a{sv}" => match value {
            Value::Map(_) => marshall_value(value),
            _ => Err(coercion_error()),
        },
        _ => Err(CodecError::InvalidType(type_code.to_string())),
    }
}
