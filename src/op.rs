//! Sync operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    record::{Payload, replace_id_field},
    types::{Identity, OpId, OpKind, Partition, Priority, RetryCount, TimestampMs},
};

/// Version number for serialized [`QueueEnvelope`] payloads.
pub const QUEUE_FORMAT_VERSION: u16 = 1;

/// Pending remote effect of one local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Client-generated identifier.
    pub id: OpId,
    /// Create, update, or delete.
    pub kind: OpKind,
    /// Logical remote resource path.
    pub endpoint: String,
    /// Partition of the affected record.
    pub partition: Partition,
    /// Identity of the affected record.
    pub target: Identity,
    /// Payload snapshot taken at enqueue time.
    pub payload: Option<Payload>,
    /// Enqueue timestamp in milliseconds.
    pub enqueued_at_ms: TimestampMs,
    /// Failed attempts so far. Never decreases except by explicit reset.
    pub retry_count: RetryCount,
    /// Higher is more urgent.
    pub priority: Priority,
    /// Time of the latest failed attempt.
    #[serde(default)]
    pub last_attempt_ms: Option<TimestampMs>,
    /// Message of the latest failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Builds a fresh operation with the kind's default priority.
    pub fn new(
        kind: OpKind,
        endpoint: impl Into<String>,
        partition: Partition,
        target: Identity,
        payload: Option<Payload>,
        enqueued_at_ms: TimestampMs,
    ) -> Self {
        Self {
            id: OpId::new(),
            kind,
            endpoint: endpoint.into(),
            partition,
            target,
            payload,
            enqueued_at_ms,
            retry_count: 0,
            priority: kind.default_priority(),
            last_attempt_ms: None,
            last_error: None,
        }
    }

    /// Overrides the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// True once the retry budget is exhausted.
    pub fn is_stalled(&self, max_retries: RetryCount) -> bool {
        self.retry_count >= max_retries
    }

    /// Moves this operation from a temporary identity onto its canonical one.
    ///
    /// Rewrites the target, the trailing endpoint segment, and the payload id
    /// field wherever they still carry the temporary key. Returns false when
    /// the operation does not reference `temporary`.
    pub fn retarget(
        &mut self,
        partition: &Partition,
        temporary: &Identity,
        canonical: &Identity,
        id_field: &str,
    ) -> bool {
        if self.partition != *partition || self.target != *temporary {
            return false;
        }
        let from = temporary.key();
        let to = canonical.key();
        self.target = canonical.clone();
        if let Some(prefix) = self.endpoint.strip_suffix(from) {
            if prefix.ends_with('/') {
                self.endpoint = format!("{prefix}{to}");
            }
        }
        if let Some(payload) = self.payload.as_mut() {
            replace_id_field(payload, id_field, from, to);
        }
        true
    }
}

/// Builds the item endpoint for `collection` and `id`.
pub fn item_endpoint(collection: &str, id: &Identity) -> String {
    format!("{}/{}", collection.trim_end_matches('/'), id.key())
}

/// Versioned wrapper for the persisted queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Queue contents in enqueue order.
    pub ops: Vec<SyncOperation>,
}

impl QueueEnvelope {
    /// Constructs an envelope using [`QUEUE_FORMAT_VERSION`].
    pub fn new(ops: Vec<SyncOperation>) -> Self {
        Self {
            format_version: QUEUE_FORMAT_VERSION,
            ops,
        }
    }
}
