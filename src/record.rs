//! Cached record model and payload helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Identity, Partition, TimestampMs};

/// Opaque structured payload. Its schema is known only to the domain layer.
pub type Payload = Value;

/// One keyed record held in a store partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Partition holding the record.
    pub partition: Partition,
    /// Record identity; its key is unique within the partition.
    pub id: Identity,
    /// Record content.
    pub payload: Payload,
    /// Last local write in milliseconds since epoch.
    pub last_updated_ms: TimestampMs,
}

impl CacheRecord {
    /// Builds a record.
    pub fn new(partition: Partition, id: Identity, payload: Payload, last_updated_ms: TimestampMs) -> Self {
        Self {
            partition,
            id,
            payload,
            last_updated_ms,
        }
    }

    /// Store key of this record.
    pub fn key(&self) -> &str {
        self.id.key()
    }

    /// Returns a copy moved under `id`, with the payload id field rewritten.
    pub fn rekeyed(&self, id: Identity, id_field: &str, last_updated_ms: TimestampMs) -> Self {
        let mut payload = self.payload.clone();
        set_id_field(&mut payload, id_field, id.key());
        Self {
            partition: self.partition.clone(),
            id,
            payload,
            last_updated_ms,
        }
    }
}

/// Reads a string-or-number id field from an object payload.
pub fn id_field(payload: &Payload, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Writes `key` into `field` when the payload is an object. Other payload
/// shapes are left untouched.
pub fn set_id_field(payload: &mut Payload, field: &str, key: &str) {
    if let Value::Object(map) = payload {
        map.insert(field.to_string(), Value::String(key.to_string()));
    }
}

/// Rewrites `field` only where it currently holds `from`.
pub fn replace_id_field(payload: &mut Payload, field: &str, from: &str, to: &str) -> bool {
    match payload.get(field) {
        Some(Value::String(current)) if current == from => {
            set_id_field(payload, field, to);
            true
        }
        _ => false,
    }
}
