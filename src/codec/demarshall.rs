//! Wire → native conversion.
//!
//! Demarshalling runs on the delivery path, so nothing here returns an error:
//! values that cannot be decoded become [`Value::Invalid`] (or the target
//! type's default) and a diagnostic is logged.

use super::{Value, WireValue, MAX_DEPTH};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tracing::warn;

/// Normalize a wire value into a [`Value`].
///
/// - scalars pass through
/// - byte buffers become lists of bytes
/// - object paths and signatures become strings
/// - file descriptors become their integer value
/// - variants are unwrapped
/// - arrays and structs become lists (struct fields are positional)
/// - dictionaries become string-keyed maps
///
/// Branches nested deeper than [`MAX_DEPTH`] become [`Value::Invalid`];
/// their siblings are still decoded.
pub fn demarshall(value: &WireValue) -> Value {
    demarshall_at(value, 0)
}

fn demarshall_at(value: &WireValue, depth: usize) -> Value {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        warn!("Too deep recursion detected at type: {}", value.type_code());
        return Value::Invalid;
    }

    match value {
        WireValue::Byte(v) => Value::Byte(*v),
        WireValue::Bool(v) => Value::Bool(*v),
        WireValue::Int16(v) => Value::Int16(*v),
        WireValue::UInt16(v) => Value::UInt16(*v),
        WireValue::Int32(v) => Value::Int32(*v),
        WireValue::UInt32(v) => Value::UInt32(*v),
        WireValue::Int64(v) => Value::Int64(*v),
        WireValue::UInt64(v) => Value::UInt64(*v),
        WireValue::Double(v) => Value::Double(*v),
        WireValue::String(s) | WireValue::ObjectPath(s) | WireValue::Signature(s) => {
            Value::String(s.clone())
        }
        WireValue::UnixFd(fd) => Value::Int32(*fd),
        WireValue::Bytes(bytes) => Value::List(bytes.iter().map(|b| Value::Byte(*b)).collect()),
        WireValue::Variant(inner) => demarshall_at(inner, depth),
        WireValue::Array { items, .. } => {
            Value::List(items.iter().map(|item| demarshall_at(item, depth)).collect())
        }
        WireValue::Struct(fields) => {
            Value::List(fields.iter().map(|field| demarshall_at(field, depth)).collect())
        }
        WireValue::Dict { entries, .. } => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (demarshall_at(k, depth).to_key_string(), demarshall_at(v, depth)))
                .collect(),
        ),
        WireValue::Unsupported { signature } => {
            warn!("Unhandled wire element type: {}", signature);
            Value::Invalid
        }
    }
}

/// Typed extraction of a wire value into a Rust type.
///
/// Composite wire values (arrays, structs, dictionaries) are extracted
/// structurally; scalars are coerced when the conversion is lossless.
/// Returns `None` when the value does not fit.
pub trait Demarshall: Sized {
    fn demarshall(value: &WireValue) -> Option<Self>;
}

/// Extract `T` from an optional reply argument.
///
/// A missing argument yields `T::default()`. So does a mismatched one, after a
/// diagnostic.
pub fn demarshall_as<T: Demarshall + Default>(value: Option<&WireValue>) -> T {
    match value {
        None => T::default(),
        Some(value) => T::demarshall(value).unwrap_or_else(|| {
            warn!(
                "Cannot convert wire value of type {} to {}",
                value.signature(),
                std::any::type_name::<T>()
            );
            T::default()
        }),
    }
}

/// The raw composite type: returned as-is.
impl Demarshall for WireValue {
    fn demarshall(value: &WireValue) -> Option<Self> {
        Some(value.clone())
    }
}

/// The dynamic type: one variant layer is stripped, then the value is
/// normalized.
impl Demarshall for Value {
    fn demarshall(value: &WireValue) -> Option<Self> {
        Some(demarshall(value.unwrap_variant()))
    }
}

fn integer_of(value: &WireValue) -> Option<i128> {
    Some(match *value {
        WireValue::Byte(v) => v.into(),
        WireValue::Int16(v) => v.into(),
        WireValue::UInt16(v) => v.into(),
        WireValue::Int32(v) => v.into(),
        WireValue::UInt32(v) => v.into(),
        WireValue::Int64(v) => v.into(),
        WireValue::UInt64(v) => v.into(),
        WireValue::UnixFd(v) => v.into(),
        WireValue::Double(v) if v.fract() == 0.0 && v.is_finite() => v as i128,
        _ => return None,
    })
}

macro_rules! demarshall_integer {
    ($($ty:ty),*) => {
        $(
            impl Demarshall for $ty {
                fn demarshall(value: &WireValue) -> Option<Self> {
                    integer_of(value).and_then(|v| <$ty>::try_from(v).ok())
                }
            }
        )*
    };
}

demarshall_integer!(u8, i16, u16, i32, u32, i64, u64);

impl Demarshall for f64 {
    fn demarshall(value: &WireValue) -> Option<Self> {
        match *value {
            WireValue::Double(v) => Some(v),
            _ => integer_of(value).map(|v| v as f64),
        }
    }
}

impl Demarshall for bool {
    fn demarshall(value: &WireValue) -> Option<Self> {
        match *value {
            WireValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl Demarshall for String {
    fn demarshall(value: &WireValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl<T: Demarshall> Demarshall for Vec<T> {
    fn demarshall(value: &WireValue) -> Option<Self> {
        match value {
            WireValue::Array { items, .. } => items.iter().map(T::demarshall).collect(),
            WireValue::Bytes(bytes) => bytes
                .iter()
                .map(|b| T::demarshall(&WireValue::Byte(*b)))
                .collect(),
            _ => None,
        }
    }
}

fn dict_entries<K, V>(value: &WireValue) -> Option<impl Iterator<Item = Option<(K, V)>> + '_>
where
    K: Demarshall,
    V: Demarshall,
{
    match value {
        WireValue::Dict { entries, .. } => Some(
            entries
                .iter()
                .map(|(k, v)| Some((K::demarshall(k)?, V::demarshall(v)?))),
        ),
        _ => None,
    }
}

impl<K: Demarshall + Ord, V: Demarshall> Demarshall for BTreeMap<K, V> {
    fn demarshall(value: &WireValue) -> Option<Self> {
        dict_entries(value)?.collect()
    }
}

impl<K: Demarshall + Eq + Hash, V: Demarshall> Demarshall for HashMap<K, V> {
    fn demarshall(value: &WireValue) -> Option<Self> {
        dict_entries(value)?.collect()
    }
}

macro_rules! demarshall_tuple {
    ($len:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Demarshall),+> Demarshall for ($($name,)+) {
            fn demarshall(value: &WireValue) -> Option<Self> {
                match value {
                    WireValue::Struct(fields) if fields.len() == $len => {
                        Some(($($name::demarshall(&fields[$idx])?,)+))
                    }
                    _ => None,
                }
            }
        }
    };
}

demarshall_tuple!(1; A: 0);
demarshall_tuple!(2; A: 0, B: 1);
demarshall_tuple!(3; A: 0, B: 1, C: 2);
demarshall_tuple!(4; A: 0, B: 1, C: 2, D: 3);

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_arrays(levels: usize) -> WireValue {
        let mut value = WireValue::Int32(7);
        let mut element = "i".to_string();
        for _ in 1..levels {
            let signature = value.signature();
            value = WireValue::Array {
                element: element.clone(),
                items: vec![value],
            };
            element = format!("a{}", element);
            debug_assert_eq!(format!("a{}", signature), value.signature());
        }
        value
    }

    fn innermost(mut value: &Value) -> &Value {
        while let Value::List(items) = value {
            value = &items[0];
        }
        value
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(demarshall(&WireValue::Int32(12)), Value::Int32(12));
        assert_eq!(demarshall(&WireValue::UInt64(5)), Value::UInt64(5));
        assert_eq!(demarshall(&WireValue::Bool(false)), Value::Bool(false));
        assert_eq!(demarshall(&WireValue::Double(0.5)), Value::Double(0.5));
        assert_eq!(demarshall(&WireValue::String("hi".into())), Value::from("hi"));
    }

    #[test]
    fn test_special_types_are_lowered() {
        assert_eq!(
            demarshall(&WireValue::Bytes(vec![0, 255])),
            Value::List(vec![Value::Byte(0), Value::Byte(255)])
        );
        assert_eq!(
            demarshall(&WireValue::ObjectPath("/org/example".into())),
            Value::from("/org/example")
        );
        assert_eq!(demarshall(&WireValue::Signature("a{sv}".into())), Value::from("a{sv}"));
        assert_eq!(demarshall(&WireValue::UnixFd(4)), Value::Int32(4));
    }

    #[test]
    fn test_containers_recurse() {
        let wire = WireValue::Dict {
            key: "s".into(),
            value: "v".into(),
            entries: vec![
                (
                    WireValue::String("point".into()),
                    WireValue::Variant(Box::new(WireValue::Struct(vec![
                        WireValue::Int32(1),
                        WireValue::Int32(2),
                    ]))),
                ),
                (
                    WireValue::String("names".into()),
                    WireValue::Variant(Box::new(WireValue::Array {
                        element: "o".into(),
                        items: vec![WireValue::ObjectPath("/a".into())],
                    })),
                ),
            ],
        };

        let value = demarshall(&wire);
        let map = value.as_map().unwrap();
        assert_eq!(map["point"], Value::List(vec![Value::Int32(1), Value::Int32(2)]));
        assert_eq!(map["names"], Value::List(vec![Value::from("/a")]));
    }

    #[test]
    fn test_dict_keys_are_coerced_to_strings() {
        let wire = WireValue::Dict {
            key: "u".into(),
            value: "s".into(),
            entries: vec![(WireValue::UInt32(3), WireValue::String("three".into()))],
        };
        assert_eq!(demarshall(&wire).as_map().unwrap()["3"], Value::from("three"));
    }

    #[test]
    fn test_unsupported_degrades_without_touching_siblings() {
        let wire = WireValue::Struct(vec![
            WireValue::Int32(1),
            WireValue::Unsupported {
                signature: "mi".into(),
            },
            WireValue::String("after".into()),
        ]);
        assert_eq!(
            demarshall(&wire),
            Value::List(vec![Value::Int32(1), Value::Invalid, Value::from("after")])
        );
    }

    #[test]
    fn test_depth_limit_allows_32_levels() {
        let value = demarshall(&nested_arrays(MAX_DEPTH));
        assert_eq!(innermost(&value), &Value::Int32(7));
    }

    #[test]
    fn test_depth_limit_cuts_deeper_branch_only() {
        let deep = nested_arrays(MAX_DEPTH + 1);
        let value = demarshall(&WireValue::Struct(vec![deep, WireValue::Bool(true)]));

        let fields = value.as_list().unwrap();
        assert_eq!(innermost(&fields[0]), &Value::Invalid);
        assert_eq!(fields[1], Value::Bool(true));
    }

    #[test]
    fn test_deep_variant_chain_is_invalid() {
        let mut wire = WireValue::Int32(1);
        for _ in 0..40 {
            wire = WireValue::Variant(Box::new(wire));
        }
        assert_eq!(demarshall(&wire), Value::Invalid);
    }

    #[test]
    fn test_typed_scalars() {
        assert_eq!(i32::demarshall(&WireValue::Int32(12)), Some(12));
        assert_eq!(i64::demarshall(&WireValue::UInt32(7)), Some(7));
        assert_eq!(u8::demarshall(&WireValue::Int32(300)), None);
        assert_eq!(f64::demarshall(&WireValue::Int16(-2)), Some(-2.0));
        assert_eq!(String::demarshall(&WireValue::ObjectPath("/x".into())), Some("/x".into()));
        assert_eq!(bool::demarshall(&WireValue::Int32(1)), None);
    }

    #[test]
    fn test_typed_composites() {
        let array = WireValue::Array {
            element: "s".into(),
            items: vec![WireValue::String("a".into()), WireValue::String("b".into())],
        };
        assert_eq!(Vec::<String>::demarshall(&array), Some(vec!["a".into(), "b".into()]));
        assert_eq!(Vec::<u8>::demarshall(&WireValue::Bytes(vec![1, 2])), Some(vec![1, 2]));

        let pair = WireValue::Struct(vec![WireValue::String("k".into()), WireValue::UInt32(2)]);
        assert_eq!(<(String, u32)>::demarshall(&pair), Some(("k".into(), 2)));
        assert_eq!(<(String, u32, bool)>::demarshall(&pair), None);

        let dict = WireValue::Dict {
            key: "s".into(),
            value: "i".into(),
            entries: vec![(WireValue::String("x".into()), WireValue::Int32(1))],
        };
        let map = HashMap::<String, i32>::demarshall(&dict).unwrap();
        assert_eq!(map["x"], 1);
    }

    #[test]
    fn test_raw_and_dynamic_targets() {
        let wire = WireValue::Variant(Box::new(WireValue::ObjectPath("/p".into())));
        assert_eq!(WireValue::demarshall(&wire), Some(wire.clone()));
        assert_eq!(Value::demarshall(&wire), Some(Value::from("/p")));
    }

    #[test]
    fn test_demarshall_as_defaults() {
        assert_eq!(demarshall_as::<i32>(None), 0);
        assert_eq!(demarshall_as::<i32>(Some(&WireValue::String("x".into()))), 0);
        assert_eq!(demarshall_as::<String>(Some(&WireValue::String("x".into()))), "x");
        assert_eq!(demarshall_as::<Value>(None), Value::Invalid);
    }
}
