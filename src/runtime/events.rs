//! Engine event stream payloads.

use crate::{
    runtime::coordinator::SyncReport,
    types::{Identity, OpId, OpKind, Partition, RetryCount},
};

/// Events emitted by the repository, coordinator and scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A pass passed the guard and connectivity checks.
    PassStarted {
        /// Operations eligible at pass start.
        pending: usize,
    },
    /// The server confirmed an operation; it left the queue.
    OperationSucceeded {
        /// Operation id.
        id: OpId,
        /// Operation kind.
        kind: OpKind,
    },
    /// An attempt failed; the operation stays queued.
    OperationFailed {
        /// Operation id.
        id: OpId,
        /// Retry count after this failure.
        retry_count: RetryCount,
        /// Failure message.
        error: String,
    },
    /// An operation exhausted its retry budget and needs a decision
    /// (retry or discard).
    OperationStalled {
        /// Operation id.
        id: OpId,
        /// Remote endpoint it targets.
        endpoint: String,
        /// Latest failure message.
        error: String,
    },
    /// A temporary identity was rewritten to the server key.
    Reconciled {
        /// Partition of the record.
        partition: Partition,
        /// Placeholder identity.
        temporary: Identity,
        /// Server-issued identity.
        canonical: Identity,
    },
    /// A create succeeded but the record could not be moved to a server key.
    ReconciliationFailed {
        /// Operation id.
        id: OpId,
        /// Identity left in place.
        temporary: Identity,
        /// Reason.
        reason: String,
    },
    /// A pass completed (or was aborted).
    PassFinished(SyncReport),
    /// Connectivity changed.
    ConnectivityChanged {
        /// New state.
        online: bool,
    },
    /// Local storage failed; the cache is now stale-read-only.
    StorageDegraded {
        /// Failure message.
        error: String,
    },
    /// Local storage accepted writes again.
    StorageRecovered,
    /// Expired records were removed.
    Swept {
        /// Number of records removed.
        removed: usize,
    },
}
