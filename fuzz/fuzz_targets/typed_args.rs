//! Fuzz target for command-line typed arguments.
//!
//! Parses `TYPE:VALUE` strings and marshalls the result; malformed input
//! must come back as an error, never a panic.

#![no_main]

use busline::codec::{marshall_typed, TypedArg};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(arg) = TypedArg::parse(s) {
            let _ = marshall_typed(&arg);
        }
    }
});
