//! Cache repository and mutation queue.

/// Durable mutation queue.
pub mod queue;
/// Typed repository over the record store.
pub mod repository;
