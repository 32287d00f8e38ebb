//! Collapsing arrays of variants into typed arrays.
//!
//! Dynamic lists marshal as `av` by default. Most services expect typed
//! arrays (`as`, `ai`, ...), so before sending we try to turn a homogeneous
//! `av` into the matching typed array.

use super::{demarshall, Value, WireValue};
use tracing::warn;

/// Element types [`flatten_variant_array_force_type`] can build.
pub(crate) const FORCEABLE_CODES: &str = "byqutnixdsog";

/// Replace a homogeneous array of variants by the typed array it holds.
///
/// Only applies when every element is a variant wrapping the same scalar
/// type, and that type is one of string, bool, int32 or double. Anything
/// else (non-arrays, empty arrays, mixed element types) is left unchanged.
/// Applying it twice is the same as applying it once.
pub fn flatten_variant_array_guess_type(value: &mut WireValue) {
    let WireValue::Array { element, items } = value else {
        return;
    };
    if element.as_str() != "v" || items.is_empty() {
        return;
    }

    let mut codes = items.iter().map(|item| match item {
        WireValue::Variant(inner) => Some(inner.type_code()),
        _ => None,
    });
    let Some(Some(first)) = codes.next() else {
        return;
    };
    if !codes.all(|code| code == Some(first)) {
        return;
    }

    match first {
        's' | 'b' | 'i' | 'd' => {
            let inner = std::mem::take(items)
                .into_iter()
                .map(WireValue::into_inner_variant)
                .collect();
            *value = WireValue::Array {
                element: first.to_string(),
                items: inner,
            };
        }
        other => {
            // Stays `av`: the receiver sees variant:array:variant:value
            warn!("Unhandled array type: {}", other);
        }
    }
}

/// Coerce every element of an array to `type_code` and build the typed array.
///
/// Supported codes are `b y q u t n i x d s o g`. `y` produces
/// [`WireValue::Bytes`], every other code a [`WireValue::Array`] with that
/// element type. Elements may be plain or variant-wrapped. Returns `false`,
/// leaving the value unchanged, for unsupported codes, non-array input, or
/// elements that cannot be coerced.
pub fn flatten_variant_array_force_type(value: &mut WireValue, type_code: char) -> bool {
    if !FORCEABLE_CODES.contains(type_code) {
        return false;
    }

    let items = match value {
        WireValue::Array { items, .. } => items,
        _ => return false,
    };

    let coerced: Option<Vec<WireValue>> = items
        .iter()
        .map(|item| coerce_scalar(&demarshall(item), type_code))
        .collect();

    let Some(items) = coerced else {
        return false;
    };
    *value = if type_code == 'y' {
        WireValue::Bytes(
            items
                .into_iter()
                .filter_map(|item| match item {
                    WireValue::Byte(byte) => Some(byte),
                    _ => None,
                })
                .collect(),
        )
    } else {
        WireValue::Array {
            element: type_code.to_string(),
            items,
        }
    };
    true
}

/// Convert a native scalar to the wire scalar named by `type_code`.
///
/// Integers must fit the target range; doubles only convert to integer types
/// when they have no fractional part.
pub(crate) fn coerce_scalar(value: &Value, type_code: char) -> Option<WireValue> {
    fn integral(value: &Value) -> Option<i128> {
        match *value {
            Value::Double(d) if d.is_finite() && d.fract() == 0.0 => Some(d as i128),
            Value::UInt64(v) => Some(v.into()),
            _ => value.as_i64().map(i128::from),
        }
    }

    Some(match type_code {
        'y' => WireValue::Byte(u8::try_from(integral(value)?).ok()?),
        'q' => WireValue::UInt16(u16::try_from(integral(value)?).ok()?),
        'u' => WireValue::UInt32(u32::try_from(integral(value)?).ok()?),
        't' => WireValue::UInt64(u64::try_from(integral(value)?).ok()?),
        'n' => WireValue::Int16(i16::try_from(integral(value)?).ok()?),
        'i' => WireValue::Int32(i32::try_from(integral(value)?).ok()?),
        'x' => WireValue::Int64(i64::try_from(integral(value)?).ok()?),
        'd' => WireValue::Double(value.as_f64()?),
        'b' => match value {
            Value::Bool(b) => WireValue::Bool(*b),
            _ => return None,
        },
        's' => match value {
            Value::String(s) => WireValue::String(s.clone()),
            Value::List(_) | Value::Map(_) | Value::Invalid => return None,
            scalar => WireValue::String(scalar.to_key_string()),
        },
        'o' => WireValue::ObjectPath(value.as_str()?.to_string()),
        'g' => WireValue::Signature(value.as_str()?.to_string()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants(items: Vec<WireValue>) -> WireValue {
        WireValue::Array {
            element: "v".into(),
            items: items.into_iter().map(|i| WireValue::Variant(Box::new(i))).collect(),
        }
    }

    #[test]
    fn test_guess_homogeneous_strings() {
        let mut value = variants(vec![
            WireValue::String("a".into()),
            WireValue::String("b".into()),
        ]);
        flatten_variant_array_guess_type(&mut value);
        assert_eq!(value.signature(), "as");

        let once = value.clone();
        flatten_variant_array_guess_type(&mut value);
        assert_eq!(value, once);
    }

    #[test]
    fn test_guess_leaves_mixed_and_empty_arrays() {
        let mut mixed = variants(vec![WireValue::Int32(1), WireValue::String("x".into())]);
        let before = mixed.clone();
        flatten_variant_array_guess_type(&mut mixed);
        assert_eq!(mixed, before);

        let mut empty = variants(vec![]);
        flatten_variant_array_guess_type(&mut empty);
        assert_eq!(empty.signature(), "av");
    }

    #[test]
    fn test_guess_leaves_unhandled_types() {
        let mut value = variants(vec![WireValue::Int64(1), WireValue::Int64(2)]);
        flatten_variant_array_guess_type(&mut value);
        assert_eq!(value.signature(), "av");
    }

    #[test]
    fn test_force_type() {
        let mut value = variants(vec![WireValue::Int32(1), WireValue::Double(2.0)]);
        assert!(flatten_variant_array_force_type(&mut value, 'u'));
        assert_eq!(
            value,
            WireValue::Array {
                element: "u".into(),
                items: vec![WireValue::UInt32(1), WireValue::UInt32(2)]
            }
        );
    }

    #[test]
    fn test_force_type_failure_keeps_value() {
        let mut value = variants(vec![WireValue::Int32(-1)]);
        let before = value.clone();
        assert!(!flatten_variant_array_force_type(&mut value, 'u'));
        assert_eq!(value, before);

        assert!(!flatten_variant_array_force_type(&mut value, 'o'));
        assert!(!flatten_variant_array_force_type(&mut value, 'v'));
        assert!(!flatten_variant_array_force_type(&mut WireValue::Int32(1), 'i'));
    }

    #[test]
    fn test_force_bytes_and_paths() {
        let mut bytes = variants(vec![WireValue::Int32(1), WireValue::Byte(255)]);
        assert!(flatten_variant_array_force_type(&mut bytes, 'y'));
        assert_eq!(bytes, WireValue::Bytes(vec![1, 255]));

        let mut paths = variants(vec![WireValue::String("/a".into()), WireValue::ObjectPath("/b".into())]);
        assert!(flatten_variant_array_force_type(&mut paths, 'o'));
        assert_eq!(
            paths,
            WireValue::Array {
                element: "o".into(),
                items: vec![WireValue::ObjectPath("/a".into()), WireValue::ObjectPath("/b".into())]
            }
        );

        let mut signatures = variants(vec![WireValue::String("a{sv}".into())]);
        assert!(flatten_variant_array_force_type(&mut signatures, 'g'));
        assert_eq!(signatures.signature(), "ag");
    }

    #[test]
    fn test_coerce_scalar() {
        assert_eq!(coerce_scalar(&Value::Int32(255), 'y'), Some(WireValue::Byte(255)));
        assert_eq!(coerce_scalar(&Value::Int32(256), 'y'), None);
        assert_eq!(coerce_scalar(&Value::Double(1.5), 'i'), None);
        assert_eq!(coerce_scalar(&Value::Int32(3), 's'), Some(WireValue::String("3".into())));
        assert_eq!(coerce_scalar(&Value::Int32(1), 'b'), None);
        assert_eq!(
            coerce_scalar(&Value::from("/a/b"), 'o'),
            Some(WireValue::ObjectPath("/a/b".into()))
        );
    }
}
