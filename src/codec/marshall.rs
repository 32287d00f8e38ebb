//! Native → wire conversion.

use super::flatten::flatten_variant_array_guess_type;
use super::{CodecError, Value, WireValue};
use std::collections::{BTreeMap, HashMap};

/// Static D-Bus signature of a Rust type.
pub trait WireType {
    fn signature() -> String;
}

/// Conversion of a Rust value into a wire value.
pub trait Marshall {
    fn marshall(self) -> WireValue;
}

/// Convert any [`Marshall`] value.
pub fn marshall<T: Marshall>(value: T) -> WireValue {
    value.marshall()
}

/// Wraps a value so it is sent as a variant (`v`).
#[derive(Debug, Clone, PartialEq)]
pub struct AsVariant<T>(pub T);

/// A string sent as an object path (`o`) rather than a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(pub String);

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        ObjectPath(path.to_string())
    }
}

macro_rules! scalar {
    ($ty:ty, $code:literal, $variant:ident) => {
        impl WireType for $ty {
            fn signature() -> String {
                $code.to_string()
            }
        }

        impl Marshall for $ty {
            fn marshall(self) -> WireValue {
                WireValue::$variant(self)
            }
        }
    };
}

scalar!(u8, "y", Byte);
scalar!(bool, "b", Bool);
scalar!(i16, "n", Int16);
scalar!(u16, "q", UInt16);
scalar!(i32, "i", Int32);
scalar!(u32, "u", UInt32);
scalar!(i64, "x", Int64);
scalar!(u64, "t", UInt64);
scalar!(f64, "d", Double);
scalar!(String, "s", String);

impl WireType for &str {
    fn signature() -> String {
        "s".to_string()
    }
}

impl Marshall for &str {
    fn marshall(self) -> WireValue {
        WireValue::String(self.to_string())
    }
}

impl WireType for ObjectPath {
    fn signature() -> String {
        "o".to_string()
    }
}

impl Marshall for ObjectPath {
    fn marshall(self) -> WireValue {
        WireValue::ObjectPath(self.0)
    }
}

impl<T> WireType for AsVariant<T> {
    fn signature() -> String {
        "v".to_string()
    }
}

impl<T: Marshall> Marshall for AsVariant<T> {
    fn marshall(self) -> WireValue {
        WireValue::Variant(Box::new(self.0.marshall()))
    }
}

impl Marshall for WireValue {
    fn marshall(self) -> WireValue {
        self
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn signature() -> String {
        format!("a{}", T::signature())
    }
}

impl<T: Marshall + WireType> Marshall for Vec<T> {
    fn marshall(self) -> WireValue {
        WireValue::Array {
            element: T::signature(),
            items: self.into_iter().map(Marshall::marshall).collect(),
        }
    }
}

fn dict<K, V>(entries: impl Iterator<Item = (K, V)>) -> WireValue
where
    K: Marshall + WireType,
    V: Marshall + WireType,
{
    WireValue::Dict {
        key: K::signature(),
        value: V::signature(),
        entries: entries.map(|(k, v)| (k.marshall(), v.marshall())).collect(),
    }
}

impl<K: WireType, V: WireType> WireType for BTreeMap<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }
}

impl<K: Marshall + WireType, V: Marshall + WireType> Marshall for BTreeMap<K, V> {
    fn marshall(self) -> WireValue {
        dict(self.into_iter())
    }
}

impl<K: WireType, V: WireType> WireType for HashMap<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }
}

impl<K: Marshall + WireType, V: Marshall + WireType> Marshall for HashMap<K, V> {
    fn marshall(self) -> WireValue {
        dict(self.into_iter())
    }
}

/// The argument list of an outgoing call.
///
/// Implemented for `()`, tuples of [`Marshall`] values (each element is one
/// argument) and pre-built `Vec<WireValue>`.
pub trait IntoArguments {
    fn into_arguments(self) -> Vec<WireValue>;
}

impl IntoArguments for () {
    fn into_arguments(self) -> Vec<WireValue> {
        Vec::new()
    }
}

impl IntoArguments for Vec<WireValue> {
    fn into_arguments(self) -> Vec<WireValue> {
        self
    }
}

macro_rules! tuples {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: WireType),+> WireType for ($($name,)+) {
            fn signature() -> String {
                let mut signature = String::from("(");
                $(signature.push_str(&$name::signature());)+
                signature.push(')');
                signature
            }
        }

        impl<$($name: Marshall),+> Marshall for ($($name,)+) {
            fn marshall(self) -> WireValue {
                WireValue::Struct(vec![$(self.$idx.marshall()),+])
            }
        }

        impl<$($name: Marshall),+> IntoArguments for ($($name,)+) {
            fn into_arguments(self) -> Vec<WireValue> {
                vec![$(self.$idx.marshall()),+]
            }
        }
    };
}

tuples!(A: 0);
tuples!(A: 0, B: 1);
tuples!(A: 0, B: 1, C: 2);
tuples!(A: 0, B: 1, C: 2, D: 3);
tuples!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuples!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Pick a wire representation for a dynamic value.
///
/// Scalars map to their natural type. Lists are sent as `av` and then
/// collapsed into a typed array when homogeneous
/// (see [`flatten_variant_array_guess_type`]). Maps become `a{sv}`.
pub fn marshall_value(value: &Value) -> Result<WireValue, CodecError> {
    Ok(match value {
        Value::Invalid => return Err(CodecError::InvalidValue),
        Value::Bool(v) => WireValue::Bool(*v),
        Value::Byte(v) => WireValue::Byte(*v),
        Value::Int16(v) => WireValue::Int16(*v),
        Value::UInt16(v) => WireValue::UInt16(*v),
        Value::Int32(v) => WireValue::Int32(*v),
        Value::UInt32(v) => WireValue::UInt32(*v),
        Value::Int64(v) => WireValue::Int64(*v),
        Value::UInt64(v) => WireValue::UInt64(*v),
        Value::Double(v) => WireValue::Double(*v),
        Value::String(s) => WireValue::String(s.clone()),
        Value::List(items) => {
            let mut array = WireValue::Array {
                element: "v".to_string(),
                items: items
                    .iter()
                    .map(|item| Ok(WireValue::Variant(Box::new(marshall_value(item)?))))
                    .collect::<Result<_, CodecError>>()?,
            };
            flatten_variant_array_guess_type(&mut array);
            array
        }
        Value::Map(map) => WireValue::Dict {
            key: "s".to_string(),
            value: "v".to_string(),
            entries: map
                .iter()
                .map(|(k, v)| {
                    Ok((
                        WireValue::String(k.clone()),
                        WireValue::Variant(Box::new(marshall_value(v)?)),
                    ))
                })
                .collect::<Result<_, CodecError>>()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::super::demarshall;
    use super::*;

    #[test]
    fn test_scalars_survive_a_round_trip() {
        assert_eq!(demarshall(&marshall(12i32)), Value::Int32(12));
        assert_eq!(demarshall(&marshall(u64::MAX)), Value::UInt64(u64::MAX));
        assert_eq!(demarshall(&marshall(-3i16)), Value::Int16(-3));
        assert_eq!(demarshall(&marshall(true)), Value::Bool(true));
        assert_eq!(demarshall(&marshall("hello")), Value::from("hello"));
        assert_eq!(demarshall(&marshall(2.5f64)), Value::Double(2.5));
    }

    #[test]
    fn test_static_signatures() {
        assert_eq!(<Vec<String>>::signature(), "as");
        assert_eq!(<BTreeMap<String, AsVariant<i32>>>::signature(), "a{sv}");
        assert_eq!(<(i32, ObjectPath, Vec<u8>)>::signature(), "(ioay)");
    }

    #[test]
    fn test_empty_vec_keeps_element_type() {
        assert_eq!(marshall(Vec::<u32>::new()).signature(), "au");
    }

    #[test]
    fn test_arguments() {
        assert!(().into_arguments().is_empty());

        let args = ("org.example.Iface", "Name").into_arguments();
        assert_eq!(
            args,
            vec![
                WireValue::String("org.example.Iface".into()),
                WireValue::String("Name".into())
            ]
        );

        let args = (AsVariant(5u32), ObjectPath::from("/a")).into_arguments();
        assert_eq!(args[0], WireValue::Variant(Box::new(WireValue::UInt32(5))));
        assert_eq!(args[1], WireValue::ObjectPath("/a".into()));
    }

    #[test]
    fn test_marshall_value_lists() {
        let homogeneous = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(marshall_value(&homogeneous).unwrap().signature(), "as");

        let mixed = Value::List(vec![Value::Int32(1), Value::from("b")]);
        assert_eq!(marshall_value(&mixed).unwrap().signature(), "av");
    }

    #[test]
    fn test_marshall_value_maps() {
        let mut map = BTreeMap::new();
        map.insert("ids".to_string(), Value::List(vec![Value::Int32(1), Value::Int32(2)]));
        let wire = marshall_value(&Value::Map(map)).unwrap();
        assert_eq!(wire.signature(), "a{sv}");

        let WireValue::Dict { entries, .. } = wire else {
            panic!("expected a dictionary");
        };
        assert_eq!(entries[0].1.unwrap_variant().signature(), "ai");
    }

    #[test]
    fn test_marshall_value_rejects_invalid() {
        assert_eq!(marshall_value(&Value::Invalid), Err(CodecError::InvalidValue));
        assert_eq!(
            marshall_value(&Value::List(vec![Value::Invalid])),
            Err(CodecError::InvalidValue)
        );
    }
}
