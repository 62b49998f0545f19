//! Engine-level error taxonomy.

use crate::{
    persist::StorageError,
    types::{Identity, OpId},
};

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Local persistence failed; the engine keeps serving stale reads.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The queue is full and refused a new operation.
    #[error("mutation queue full ({capacity} operations)")]
    Backpressure {
        /// Configured queue capacity.
        capacity: usize,
    },
    /// Server accepted a create but its response carried no usable key.
    #[error("create {op_id} accepted without `{field}`; record stays under {temporary}")]
    Reconciliation {
        /// Operation that succeeded.
        op_id: OpId,
        /// Temporary identity left in place.
        temporary: Identity,
        /// Expected id field.
        field: String,
    },
    /// No queued operation with this id.
    #[error("operation {0} is not queued")]
    UnknownOperation(OpId),
    /// The scheduler task is gone.
    #[error("sync worker channel closed")]
    ChannelClosed,
}

/// Result alias for engine calls.
pub type SyncResult<T> = Result<T, SyncError>;
