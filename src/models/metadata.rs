use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// Maximum recursion depth for metadata payloads. Values nested deeper
/// are truncated (and subsequently pruned as empties).
pub const MAX_PAYLOAD_DEPTH: usize = 16;

/// Kind of metadata record attached to a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataType {
    Nip11Info,
    Nip66Rtt,
    Nip66Ssl,
    Nip66Geo,
    Nip66Net,
    Nip66Dns,
    Nip66Http,
}

impl MetadataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataType::Nip11Info => "nip11_info",
            MetadataType::Nip66Rtt => "nip66_rtt",
            MetadataType::Nip66Ssl => "nip66_ssl",
            MetadataType::Nip66Geo => "nip66_geo",
            MetadataType::Nip66Net => "nip66_net",
            MetadataType::Nip66Dns => "nip66_dns",
            MetadataType::Nip66Http => "nip66_http",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "nip11_info" => Ok(MetadataType::Nip11Info),
            "nip66_rtt" => Ok(MetadataType::Nip66Rtt),
            "nip66_ssl" => Ok(MetadataType::Nip66Ssl),
            "nip66_geo" => Ok(MetadataType::Nip66Geo),
            "nip66_net" => Ok(MetadataType::Nip66Net),
            "nip66_dns" => Ok(MetadataType::Nip66Dns),
            "nip66_http" => Ok(MetadataType::Nip66Http),
            other => Err(ProtocolError::InvalidMetadata(format!(
                "unknown metadata type {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for MetadataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, content-addressed metadata payload.
///
/// The payload is canonicalized at construction: object keys sorted,
/// nulls and empty containers pruned, non-finite floats dropped, nesting
/// depth bounded. Serialization is therefore deterministic and two
/// payloads with equal content share one storage row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    metadata_type: MetadataType,
    payload: Value,
}

impl Metadata {
    pub fn new(metadata_type: MetadataType, payload: Value) -> Result<Self, ProtocolError> {
        let payload = sanitize(payload, 0)?.unwrap_or(Value::Object(Map::new()));
        Ok(Self {
            metadata_type,
            payload,
        })
    }

    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deterministic serialization of the canonical payload.
    pub fn canonical_json(&self) -> String {
        // Keys were sorted during sanitize; plain to_string is stable.
        self.payload.to_string()
    }

    /// Content address: sha256 over type + canonical payload.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.metadata_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Recursively canonicalize a JSON value.
///
/// Returns `Ok(None)` when the value should be pruned (null, empty
/// container, non-finite number, or past the depth bound). Strings
/// containing NUL bytes are rejected outright: they cannot be stored in
/// a PostgreSQL `jsonb` column.
fn sanitize(value: Value, depth: usize) -> Result<Option<Value>, ProtocolError> {
    if depth > MAX_PAYLOAD_DEPTH {
        return Ok(None);
    }
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(Value::Bool(b))),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Ok(None);
                }
            }
            Ok(Some(Value::Number(n)))
        }
        Value::String(s) => {
            if s.contains('\0') {
                return Err(ProtocolError::InvalidMetadata(
                    "payload contains null bytes".to_string(),
                ));
            }
            Ok(Some(Value::String(s)))
        }
        Value::Array(items) => {
            let mut cleaned = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = sanitize(item, depth + 1)? {
                    cleaned.push(v);
                }
            }
            if cleaned.is_empty() && depth > 0 {
                return Ok(None);
            }
            Ok(Some(Value::Array(cleaned)))
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut cleaned = Map::new();
            for (key, val) in entries {
                if key.contains('\0') {
                    return Err(ProtocolError::InvalidMetadata(
                        "payload key contains null bytes".to_string(),
                    ));
                }
                if let Some(v) = sanitize(val, depth + 1)? {
                    cleaned.insert(key, v);
                }
            }
            if cleaned.is_empty() && depth > 0 {
                return Ok(None);
            }
            Ok(Some(Value::Object(cleaned)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Value {
        Metadata::new(MetadataType::Nip66Rtt, value)
            .unwrap()
            .payload()
            .clone()
    }

    #[test]
    fn sorts_object_keys() {
        let meta = Metadata::new(MetadataType::Nip66Rtt, json!({"b": 2, "a": 1, "c": 3})).unwrap();
        assert_eq!(meta.canonical_json(), r#"{"a":1,"b":2,"c":3}"#);
    }

    #[test]
    fn sorts_nested_keys() {
        let meta =
            Metadata::new(MetadataType::Nip66Rtt, json!({"z": {"b": 1, "a": 2}, "a": 0})).unwrap();
        assert_eq!(meta.canonical_json(), r#"{"a":0,"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn prunes_null_values() {
        assert_eq!(payload(json!({"a": 1, "b": null})), json!({"a": 1}));
    }

    #[test]
    fn prunes_empty_containers() {
        assert_eq!(
            payload(json!({"a": 1, "b": {}, "c": []})),
            json!({"a": 1})
        );
    }

    #[test]
    fn prunes_containers_emptied_by_cleaning() {
        assert_eq!(payload(json!({"a": {"b": null}})), json!({}));
    }

    #[test]
    fn cleans_lists() {
        assert_eq!(
            payload(json!({"items": [1, null, "x", {}]})),
            json!({"items": [1, "x"]})
        );
    }

    #[test]
    fn rejects_null_bytes_in_values() {
        assert!(Metadata::new(MetadataType::Nip11Info, json!({"k": "a\u{0}b"})).is_err());
    }

    #[test]
    fn rejects_null_bytes_in_keys() {
        assert!(Metadata::new(MetadataType::Nip11Info, json!({"a\u{0}": 1})).is_err());
    }

    #[test]
    fn rejects_null_bytes_nested() {
        assert!(Metadata::new(MetadataType::Nip11Info, json!({"a": ["ok", "bad\u{0}"]})).is_err());
    }

    #[test]
    fn truncates_past_max_depth() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_PAYLOAD_DEPTH + 2) {
            value = json!({ "inner": value });
        }
        // The over-deep tail collapses into pruned empties.
        let meta = Metadata::new(MetadataType::Nip66Rtt, value).unwrap();
        assert_eq!(*meta.payload(), json!({}));
    }

    #[test]
    fn serialization_roundtrip() {
        let meta = Metadata::new(
            MetadataType::Nip11Info,
            json!({"name": "relay", "supported_nips": [1, 11], "limitation": {"auth_required": false}}),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&meta.canonical_json()).unwrap();
        assert_eq!(parsed, *meta.payload());
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = Metadata::new(MetadataType::Nip66Ssl, json!({"x": 1, "y": 2})).unwrap();
        let b = Metadata::new(MetadataType::Nip66Ssl, json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_differs_by_type() {
        let a = Metadata::new(MetadataType::Nip66Rtt, json!({"v": 1})).unwrap();
        let b = Metadata::new(MetadataType::Nip66Ssl, json!({"v": 1})).unwrap();
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
