//! # Content Hashing
//!
//! BLAKE3 digests used for change detection and Merkle leaves.
//!
//! Every digest in the engine is the lowercase hex form of a BLAKE3 hash.
//! Record hashes length-prefix each field so that `("ab", "c")` and
//! `("a", "bc")` never collide.

use crate::primitives::{RELATIONSHIP_ENDPOINT_SEPARATOR, RELATIONSHIP_TYPE_SEPARATOR};
use crate::types::{Attributes, Confidence, CoreError};
use serde_json::Value;

/// Hex-encoded BLAKE3 digest of `bytes`.
#[must_use]
pub fn digest_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Deterministic business key for a relationship: `{type}:{from}->{to}`.
///
/// Validation keeps the separators out of the parts, so distinct triples
/// never share a key.
#[must_use]
pub fn relationship_instance_id(type_code: &str, from: &str, to: &str) -> String {
    format!(
        "{}{}{}{}{}",
        type_code, RELATIONSHIP_TYPE_SEPARATOR, from, RELATIONSHIP_ENDPOINT_SEPARATOR, to
    )
}

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Arrays keep their order. Two attribute maps that differ only in key
/// order produce the same string.
pub fn canonical_json(value: &Value) -> Result<String, CoreError> {
    serde_json::to_string(&canonicalize(value)).map_err(|e| CoreError::Serialization(e.to_string()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical form of an attribute map.
pub fn canonical_attributes(attributes: &Attributes) -> Result<String, CoreError> {
    let object: serde_json::Map<String, Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    canonical_json(&Value::Object(object))
}

struct FieldHasher(blake3::Hasher);

impl FieldHasher {
    fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    fn field(&mut self, value: &str) -> &mut Self {
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    fn finish(&self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// Content hash of an entity.
///
/// Covers the business key, the display name and the canonical attributes.
/// Evidence and timestamps are excluded: moving a definition to another
/// line does not change the fact.
pub fn entity_content_hash(
    type_code: &str,
    instance_id: &str,
    name: &str,
    attributes: &Attributes,
) -> Result<String, CoreError> {
    let attrs = canonical_attributes(attributes)?;
    Ok(FieldHasher::new()
        .field(type_code)
        .field(instance_id)
        .field(name)
        .field(&attrs)
        .finish())
}

/// Content hash of a relationship. Confidence is part of the content.
#[must_use]
pub fn relationship_content_hash(
    type_code: &str,
    instance_id: &str,
    name: &str,
    from_instance_id: &str,
    to_instance_id: &str,
    confidence: Confidence,
) -> String {
    FieldHasher::new()
        .field(type_code)
        .field(instance_id)
        .field(name)
        .field(from_instance_id)
        .field(to_instance_id)
        .field(&confidence.thousandths().to_string())
        .finish()
}

/// Merkle leaf for an entity.
#[must_use]
pub fn entity_leaf(instance_id: &str, content_hash: &str) -> String {
    digest_hex(format!("{}\n{}", instance_id, content_hash).as_bytes())
}

/// Merkle leaf for a relationship that ignores confidence.
#[must_use]
pub fn structural_leaf(type_code: &str, from_instance_id: &str, to_instance_id: &str) -> String {
    digest_hex(format!("{}\n{}\n{}", type_code, from_instance_id, to_instance_id).as_bytes())
}

/// Merkle leaf for a relationship including its confidence.
#[must_use]
pub fn effective_leaf(
    type_code: &str,
    from_instance_id: &str,
    to_instance_id: &str,
    confidence: Confidence,
) -> String {
    digest_hex(
        format!(
            "{}\n{}\n{}\n{}",
            type_code,
            from_instance_id,
            to_instance_id,
            confidence.thousandths()
        )
        .as_bytes(),
    )
}

/// Merkle leaf for one file in a file-tree baseline.
#[must_use]
pub fn file_leaf(relative_path: &str, contents: &[u8]) -> String {
    digest_hex(format!("{}\n{}", relative_path, digest_hex(contents)).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [1, 2], "y": null}});
        let b = json!({"a": {"y": null, "z": [1, 2]}, "b": 1});
        let ca = canonical_json(&a).expect("canonical");
        assert_eq!(ca, canonical_json(&b).expect("canonical"));
        assert_eq!(ca, r#"{"a":{"y":null,"z":[1,2]},"b":1}"#);
    }

    #[test]
    fn canonical_json_keeps_array_order() {
        let a = canonical_json(&json!([2, 1])).expect("canonical");
        let b = canonical_json(&json!([1, 2])).expect("canonical");
        assert_ne!(a, b);
    }

    #[test]
    fn entity_hash_changes_with_attributes() {
        let mut attrs = Attributes::new();
        attrs.insert("title".into(), json!("A"));
        let h1 = entity_content_hash("STORY", "S-1", "Login", &attrs).expect("hash");
        attrs.insert("title".into(), json!("B"));
        let h2 = entity_content_hash("STORY", "S-1", "Login", &attrs).expect("hash");
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let attrs = Attributes::new();
        let h1 = entity_content_hash("ab", "c", "", &attrs).expect("hash");
        let h2 = entity_content_hash("a", "bc", "", &attrs).expect("hash");
        assert_ne!(h1, h2);
    }

    #[test]
    fn effective_leaf_tracks_confidence_structural_does_not() {
        let low = Confidence::from_thousandths(500).expect("valid");
        let high = Confidence::from_thousandths(900).expect("valid");
        assert_ne!(
            effective_leaf("R02", "A", "B", low),
            effective_leaf("R02", "A", "B", high)
        );
        assert_eq!(structural_leaf("R02", "A", "B"), structural_leaf("R02", "A", "B"));
        assert_ne!(structural_leaf("R02", "A", "B"), structural_leaf("R02", "B", "A"));
    }
}
