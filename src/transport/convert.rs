//! Conversion between [`WireValue`] and `zvariant` values.

use crate::codec::{split_signature, WireValue};
use crate::error::BusError;
use tracing::warn;
use zbus::zvariant::{self, Array, Dict, Signature, StructureBuilder, Value};
use zbus::Message;

fn signature(sig: &str) -> Result<Signature, BusError> {
    Signature::try_from(sig).map_err(|e| BusError::invalid_args(format!("Bad signature {}: {}", sig, e)))
}

fn invalid(err: zvariant::Error) -> BusError {
    BusError::invalid_args(err.to_string())
}

/// Build the `zvariant` value for an outgoing argument.
pub(crate) fn to_zvalue(value: &WireValue) -> Result<Value<'static>, BusError> {
    Ok(match value {
        WireValue::Byte(v) => Value::U8(*v),
        WireValue::Bool(v) => Value::Bool(*v),
        WireValue::Int16(v) => Value::I16(*v),
        WireValue::UInt16(v) => Value::U16(*v),
        WireValue::Int32(v) => Value::I32(*v),
        WireValue::UInt32(v) => Value::U32(*v),
        WireValue::Int64(v) => Value::I64(*v),
        WireValue::UInt64(v) => Value::U64(*v),
        WireValue::Double(v) => Value::F64(*v),
        WireValue::String(s) => Value::from(s.clone()),
        WireValue::ObjectPath(p) => {
            Value::ObjectPath(zvariant::ObjectPath::try_from(p.clone()).map_err(invalid)?)
        }
        WireValue::Signature(s) => Value::Signature(signature(s)?),
        WireValue::Bytes(bytes) => Value::from(bytes.clone()),
        WireValue::Array { element, items } => {
            let mut array = Array::new(&signature(element)?);
            for item in items {
                array.append(to_zvalue(item)?).map_err(invalid)?;
            }
            Value::Array(array)
        }
        WireValue::Dict { key, value, entries } => {
            let mut dict = Dict::new(&signature(key)?, &signature(value)?);
            for (k, v) in entries {
                dict.append(to_zvalue(k)?, to_zvalue(v)?).map_err(invalid)?;
            }
            Value::Dict(dict)
        }
        WireValue::Struct(fields) => {
            let mut builder = StructureBuilder::new();
            for field in fields {
                builder = builder.append_field(to_zvalue(field)?);
            }
            Value::Structure(builder.build().map_err(invalid)?)
        }
        WireValue::Variant(inner) => Value::Value(Box::new(to_zvalue(inner)?)),
        WireValue::UnixFd(_) => {
            return Err(BusError::invalid_args("Sending file descriptors is not supported"))
        }
        WireValue::Unsupported { signature } => {
            return Err(BusError::invalid_args(format!("Cannot send values of type {}", signature)))
        }
    })
}

/// Lift a received `zvariant` value into a [`WireValue`].
pub(crate) fn from_zvalue(value: &Value<'_>) -> WireValue {
    match value {
        Value::U8(v) => WireValue::Byte(*v),
        Value::Bool(v) => WireValue::Bool(*v),
        Value::I16(v) => WireValue::Int16(*v),
        Value::U16(v) => WireValue::UInt16(*v),
        Value::I32(v) => WireValue::Int32(*v),
        Value::U32(v) => WireValue::UInt32(*v),
        Value::I64(v) => WireValue::Int64(*v),
        Value::U64(v) => WireValue::UInt64(*v),
        Value::F64(v) => WireValue::Double(*v),
        Value::Str(s) => WireValue::String(s.to_string()),
        Value::Signature(s) => WireValue::Signature(s.to_string()),
        Value::ObjectPath(p) => WireValue::ObjectPath(p.to_string()),
        Value::Value(inner) => WireValue::Variant(Box::new(from_zvalue(inner))),
        Value::Array(array) => {
            let element = array.element_signature().to_string();
            if element == "y" {
                WireValue::Bytes(
                    array
                        .iter()
                        .filter_map(|item| match item {
                            Value::U8(b) => Some(*b),
                            _ => None,
                        })
                        .collect(),
                )
            } else {
                WireValue::Array {
                    element,
                    items: array.iter().map(from_zvalue).collect(),
                }
            }
        }
        Value::Dict(dict) => {
            let full = value.value_signature().to_string();
            let Some((key, value)) = crate::codec::split_dict_signature(&full) else {
                return WireValue::Unsupported { signature: full };
            };
            WireValue::Dict {
                key,
                value,
                entries: dict
                    .iter()
                    .map(|(k, v)| (from_zvalue(k), from_zvalue(v)))
                    .collect(),
            }
        }
        Value::Structure(structure) => {
            WireValue::Struct(structure.fields().iter().map(from_zvalue).collect())
        }
        #[cfg(unix)]
        Value::Fd(fd) => {
            use std::os::fd::{AsFd, AsRawFd};
            WireValue::UnixFd(fd.as_fd().as_raw_fd())
        }
        #[allow(unreachable_patterns)]
        other => WireValue::Unsupported {
            signature: other.value_signature().to_string(),
        },
    }
}

/// The arguments of a method call as a message body.
///
/// `None` for an empty argument list.
pub(crate) fn to_body(arguments: &[WireValue]) -> Result<Option<zvariant::Structure<'static>>, BusError> {
    if arguments.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for argument in arguments {
        builder = builder.append_field(to_zvalue(argument)?);
    }
    builder.build().map(Some).map_err(invalid)
}

/// The arguments carried by a received message.
///
/// A body whose signature is a single struct is ambiguous once parsed (one
/// struct argument or several arguments); it is treated as several.
pub(crate) fn from_body(message: &Message) -> Vec<WireValue> {
    let body = message.body();
    let signature = body.signature().to_string();
    if signature.is_empty() {
        return Vec::new();
    }

    let single = split_signature(&signature).is_some_and(|types| types.len() == 1) && !signature.starts_with('(');
    if !single {
        if let Ok(structure) = body.deserialize::<zvariant::Structure<'_>>() {
            return structure.fields().iter().map(from_zvalue).collect();
        }
    }

    match body.deserialize::<Value<'_>>() {
        Ok(value) => vec![from_zvalue(&value)],
        Err(e) => {
            warn!("Cannot decode message body with signature {}: {}", signature, e);
            vec![WireValue::Unsupported { signature }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_convert_both_ways() {
        for wire in [
            WireValue::Byte(7),
            WireValue::Bool(true),
            WireValue::Int16(-3),
            WireValue::UInt32(9),
            WireValue::Int64(-1),
            WireValue::Double(0.25),
            WireValue::String("text".into()),
            WireValue::ObjectPath("/org/example".into()),
        ] {
            let value = to_zvalue(&wire).unwrap();
            assert_eq!(from_zvalue(&value), wire);
        }
    }

    #[test]
    fn test_containers_convert_both_ways() {
        let wire = WireValue::Dict {
            key: "s".into(),
            value: "v".into(),
            entries: vec![(
                WireValue::String("list".into()),
                WireValue::Variant(Box::new(WireValue::Array {
                    element: "i".into(),
                    items: vec![WireValue::Int32(1), WireValue::Int32(2)],
                })),
            )],
        };
        let value = to_zvalue(&wire).unwrap();
        assert_eq!(value.value_signature().to_string(), "a{sv}");
        assert_eq!(from_zvalue(&value), wire);
    }

    #[test]
    fn test_fds_are_not_sent() {
        assert!(to_zvalue(&WireValue::UnixFd(3)).is_err());
    }
}
