//! D-Bus signature parsing helpers.

const BASIC_TYPES: &str = "ybnqiuxtdsogh";

/// Split a signature into its complete types.
///
/// `"sa{sv}(ii)"` becomes `["s", "a{sv}", "(ii)"]`. Returns `None` if the
/// signature is malformed.
pub fn split_signature(signature: &str) -> Option<Vec<String>> {
    let bytes = signature.as_bytes();
    let mut types = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let end = complete_type_end(bytes, pos, 0)?;
        types.push(signature[pos..end].to_string());
        pos = end;
    }

    Some(types)
}

/// Check that `signature` is a well-formed sequence of complete types.
pub fn is_valid_signature(signature: &str) -> bool {
    split_signature(signature).is_some()
}

/// Split a dictionary signature `a{KV}` into its key and value signatures.
pub(crate) fn split_dict_signature(signature: &str) -> Option<(String, String)> {
    let inner = signature.strip_prefix("a{")?.strip_suffix('}')?;
    let mut parts = split_signature(inner)?.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) if key.len() == 1 && BASIC_TYPES.contains(key.as_str()) => {
            Some((key, value))
        }
        _ => None,
    }
}

fn complete_type_end(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > super::MAX_DEPTH * 2 {
        return None;
    }

    let code = *bytes.get(pos)? as char;
    match code {
        c if BASIC_TYPES.contains(c) || c == 'v' => Some(pos + 1),
        'a' => {
            if bytes.get(pos + 1) == Some(&b'{') {
                // Dict entry: exactly one basic key and one value
                let key = *bytes.get(pos + 2)? as char;
                if !BASIC_TYPES.contains(key) {
                    return None;
                }
                let value_end = complete_type_end(bytes, pos + 3, depth + 1)?;
                (bytes.get(value_end) == Some(&b'}')).then_some(value_end + 1)
            } else {
                complete_type_end(bytes, pos + 1, depth + 1)
            }
        }
        '(' => {
            let mut cursor = pos + 1;
            if bytes.get(cursor) == Some(&b')') {
                // Empty structs are not allowed
                return None;
            }
            while bytes.get(cursor) != Some(&b')') {
                cursor = complete_type_end(bytes, cursor, depth + 1)?;
            }
            Some(cursor + 1)
        }
        _ => None,
    }
}
