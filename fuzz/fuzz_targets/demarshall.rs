//! Fuzz target for value normalization.
//!
//! Builds arbitrary (and arbitrarily deep) wire values and checks that
//! demarshalling, typed extraction and array flattening never panic.

#![no_main]

use arbitrary::Arbitrary;
use busline::codec::{
    demarshall, demarshall_as, flatten_variant_array_force_type, flatten_variant_array_guess_type,
};
use busline::WireValue;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

#[derive(Arbitrary, Debug)]
enum Node {
    Byte(u8),
    Bool(bool),
    Int32(i32),
    UInt64(u64),
    Double(f64),
    Str(String),
    Path(String),
    Bytes(Vec<u8>),
    Array(Vec<Node>),
    Struct(Vec<Node>),
    Dict(Vec<(Node, Node)>),
    Variant(Box<Node>),
    Unsupported(String),
}

impl Node {
    fn build(self) -> WireValue {
        match self {
            Node::Byte(v) => WireValue::Byte(v),
            Node::Bool(v) => WireValue::Bool(v),
            Node::Int32(v) => WireValue::Int32(v),
            Node::UInt64(v) => WireValue::UInt64(v),
            Node::Double(v) => WireValue::Double(v),
            Node::Str(s) => WireValue::String(s),
            Node::Path(s) => WireValue::ObjectPath(s),
            Node::Bytes(b) => WireValue::Bytes(b),
            Node::Array(items) => WireValue::Array {
                element: "v".into(),
                items: items
                    .into_iter()
                    .map(|n| WireValue::Variant(Box::new(n.build())))
                    .collect(),
            },
            Node::Struct(fields) => WireValue::Struct(fields.into_iter().map(Node::build).collect()),
            Node::Dict(entries) => WireValue::Dict {
                key: "s".into(),
                value: "v".into(),
                entries: entries
                    .into_iter()
                    .map(|(k, v)| (k.build(), WireValue::Variant(Box::new(v.build()))))
                    .collect(),
            },
            Node::Variant(inner) => WireValue::Variant(Box::new(inner.build())),
            Node::Unsupported(signature) => WireValue::Unsupported { signature },
        }
    }
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    root: Node,
    force: char,
}

fuzz_target!(|input: FuzzInput| {
    let value = input.root.build();

    let _ = demarshall(&value);
    let _ = demarshall_as::<Vec<String>>(Some(&value));
    let _ = demarshall_as::<BTreeMap<String, i64>>(Some(&value));
    let _ = demarshall_as::<(u32, String)>(Some(&value));

    let mut guessed = value.clone();
    flatten_variant_array_guess_type(&mut guessed);

    let mut forced = value;
    if !flatten_variant_array_force_type(&mut forced, input.force) {
        let _ = demarshall(&forced);
    }
});
