//! Stable fingerprints over AI inputs: canonical serialization (sorted keys,
//! time fields stripped) hashed with FNV-1a. The contract is stability
//! across runs, not cryptographic strength.

use serde_json::Value;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Keys dropped before hashing; they vary per call without changing what the
/// input asks for. `status` flips between listening/updating as jobs run.
const STRIPPED_KEYS: &[&str] = &["nowIso", "now_iso", "status"];

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !STRIPPED_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        other => out.push_str(&other.to_string()),
    }
}

/// Canonical text form of a JSON value: object keys sorted, time keys gone.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex FNV-1a fingerprint of a serializable value.
pub fn fingerprint_of<T: serde::Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).unwrap_or(Value::Null);
    format!("{:08x}", fnv1a32(canonical_json(&json).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fnv_matches_known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn canonical_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn now_iso_never_changes_the_fingerprint() {
        let a = json!({"roomId": "R1", "nowIso": "2026-01-01T00:00:00Z", "lines": ["x"]});
        let b = json!({"roomId": "R1", "nowIso": "2026-06-30T12:34:56Z", "lines": ["x"]});
        assert_eq!(fingerprint_of(&a), fingerprint_of(&b));
    }

    #[test]
    fn different_content_changes_the_fingerprint() {
        let a = json!({"lines": ["x"]});
        let b = json!({"lines": ["y"]});
        assert_ne!(fingerprint_of(&a), fingerprint_of(&b));
    }
}
