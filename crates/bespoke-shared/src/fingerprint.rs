//! # Fingerprinting (§4.3)
//!
//! Fingerprints are stable content hashes used as Cache Entry and Lease
//! keys. Stability requires a canonical encoding: object keys sorted,
//! numbers normalized to a fixed precision, and only booleans, strings,
//! integers, and floats admitted (no references to host memory).

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Significant digits floats are rounded to before hashing. Coarse enough
/// that two numerically-equal-within-tolerance workflow inputs collide on
/// the same fingerprint, per the workflow's declared tolerance (§4.3).
const DEFAULT_FLOAT_SIGNIFICANT_DIGITS: usize = 10;

/// Compute a stable fingerprint over an ordered sequence of named parts,
/// e.g. `[("parent-molecule", mol_doc), ("fragmenter-spec", spec_doc)]`
/// for the fragmentation stage of §4.2 step 2.
pub fn fingerprint_parts(parts: &[(&str, &Value)]) -> String {
    let mut hasher = Sha256::new();
    for (label, value) in parts {
        hasher.update(label.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonicalize(value).as_bytes());
        hasher.update(b"\x1e"); // record separator between parts
    }
    hex::encode(hasher.finalize())
}

/// Canonicalize a single JSON value into a deterministic string: object
/// keys sorted, floats rounded to a fixed precision, arrays of primitives
/// used as "sorted container keys" are sorted when requested by the caller
/// via [`canonicalize_sorted_array`].
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonicalize a JSON array whose element order is not semantically
/// meaningful (e.g. a workflow's `targets` list) — sorted before encoding,
/// per §4.3 "container keys sorted".
pub fn canonicalize_sorted_array(values: &[Value]) -> String {
    let mut rendered: Vec<String> = values.iter().map(canonicalize).collect();
    rendered.sort();
    format!("[{}]", rendered.join(","))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(f) = n.as_f64() {
                out.push_str(&format_float(f));
            } else {
                out.push_str(&n.to_string());
            }
        }
        Value::String(s) => {
            out.push('"');
            out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn format_float(f: f64) -> String {
    format!("{:.*e}", DEFAULT_FLOAT_SIGNIFICANT_DIGITS, f)
}

/// Minimal local hex encoder so the crate does not take on an extra
/// dependency solely for fingerprint rendering.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_documents_produce_identical_fingerprints() {
        let a = json!({"b": 1, "a": 2.0});
        let b = json!({"a": 2.0, "b": 1});
        let fp_a = fingerprint_parts(&[("mol", &a)]);
        let fp_b = fingerprint_parts(&[("mol", &b)]);
        assert_eq!(fp_a, fp_b, "key order must not affect fingerprint");
    }

    #[test]
    fn different_documents_produce_different_fingerprints() {
        let a = json!({"smiles": "CC"});
        let b = json!({"smiles": "CCO"});
        assert_ne!(
            fingerprint_parts(&[("mol", &a)]),
            fingerprint_parts(&[("mol", &b)])
        );
    }

    #[test]
    fn labels_participate_in_the_hash() {
        let v = json!({"x": 1});
        let fp1 = fingerprint_parts(&[("fragment", &v)]);
        let fp2 = fingerprint_parts(&[("optimize", &v)]);
        assert_ne!(fp1, fp2, "stage kind must be part of the fingerprint");
    }

    #[test]
    fn sorted_array_ignores_order() {
        let forward = vec![json!(1), json!(2), json!(3)];
        let backward = vec![json!(3), json!(2), json!(1)];
        assert_eq!(
            canonicalize_sorted_array(&forward),
            canonicalize_sorted_array(&backward)
        );
    }

    #[test]
    fn output_is_hex_sha256_length() {
        let fp = fingerprint_parts(&[("x", &json!(1))]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
