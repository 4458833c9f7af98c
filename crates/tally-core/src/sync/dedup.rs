//! Content fingerprinting for duplicate detection
//!
//! Two mutations with the same entity type and semantically equal payloads
//! fingerprint identically, regardless of JSON key order. The server stores
//! the fingerprint of every live entity, so a retried or double-submitted
//! create can be recognized before it is applied.

use crate::models::{Operation, QueueEntry};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Stable hex-encoded content fingerprint for an entity payload
#[must_use]
pub fn fingerprint(entity_type: &str, payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);

    let mut hasher = blake3::Hasher::new();
    hasher.update(entity_type.as_bytes());
    hasher.update(&[0]);
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Serialize a JSON value with object keys sorted
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(value, out);
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

/// Flag creates whose fingerprint already occurred earlier in the batch
///
/// Order-preserving: `flags[i]` answers for `entries[i]`. Non-create entries
/// are never flagged. This catches the double-submit case while still
/// offline, before the server ever sees either entry.
#[must_use]
pub fn local_duplicate_flags(entries: &[QueueEntry]) -> Vec<bool> {
    let mut seen: HashSet<String> = HashSet::new();
    entries
        .iter()
        .map(|entry| {
            if entry.operation != Operation::Create {
                return false;
            }
            !seen.insert(fingerprint(&entry.entity_type, &entry.payload))
        })
        .collect()
}
