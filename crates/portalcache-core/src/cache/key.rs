//! Stable cache keys derived from a type label and a parameter bag.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Separates the type label from the parameter hash.
/// `clear_by_type` relies on every key starting with `"{label}:"`.
pub const KEY_SEPARATOR: char = ':';

/// Build the cache key for `(type_label, params)`.
///
/// Parameters are serialized with object keys sorted at every level, so two
/// bags holding the same pairs always produce the same key regardless of the
/// order they were built in.
///
/// ```
/// use portalcache_core::generate_key;
/// use serde_json::json;
///
/// assert_eq!(
///     generate_key("users", &json!({"b": 2, "a": 1})),
///     generate_key("users", &json!({"a": 1, "b": 2})),
/// );
/// ```
pub fn generate_key<P: Serialize + ?Sized>(type_label: &str, params: &P) -> String {
    let value = serde_json::to_value(params).unwrap_or_else(|e| {
        debug!(type_label, error = %e, "Cache key params failed to serialize, hashing null");
        Value::Null
    });
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    format!(
        "{}{}{:08x}",
        type_label,
        KEY_SEPARATOR,
        rolling_hash(&canonical)
    )
}

/// Prefix shared by every key generated for `type_label`
pub fn type_prefix(type_label: &str) -> String {
    format!("{}{}", type_label, KEY_SEPARATOR)
}

/// 31-multiplier polynomial hash over UTF-16 code units, wrapping at 32 bits.
/// Not collision resistant; a collision only serves a similar-looking entry.
fn rolling_hash(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(unit as i32)
        }) as u32
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_key_is_order_independent() {
        assert_eq!(
            generate_key("users", &json!({"b": 2, "a": 1})),
            generate_key("users", &json!({"a": 1, "b": 2}))
        );

        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        for i in 0..20 {
            forward.insert(format!("k{}", i), i);
        }
        for i in (0..20).rev() {
            backward.insert(format!("k{}", i), i);
        }
        assert_eq!(generate_key("x", &forward), generate_key("x", &backward));
    }

    #[test]
    fn test_nested_objects_are_canonical() {
        assert_eq!(
            generate_key("enrollments", &json!({"filter": {"z": 1, "y": [1, {"q": 2, "p": 1}]}})),
            generate_key("enrollments", &json!({"filter": {"y": [1, {"p": 1, "q": 2}], "z": 1}}))
        );
    }

    #[test]
    fn test_different_params_or_types_differ() {
        let params = json!({"id": 42});
        assert_ne!(generate_key("users", &params), generate_key("courses", &params));
        assert_ne!(
            generate_key("users", &json!({"id": 42})),
            generate_key("users", &json!({"id": 43}))
        );
        // Array order is meaningful
        assert_ne!(
            generate_key("users", &json!([1, 2])),
            generate_key("users", &json!([2, 1]))
        );
    }

    #[test]
    fn test_key_format() {
        let key = generate_key("users", &json!({}));
        assert!(key.starts_with(&type_prefix("users")));
        assert_eq!(key.len(), "users:".len() + 8);
    }

    #[test]
    fn test_rolling_hash_known_values() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
        // 97 * 31 + 98
        assert_eq!(rolling_hash("ab"), 3105);
    }
}
