//! Sync coordinator, background worker, and event stream.

/// Drain-pass state machine.
pub mod coordinator;
/// Event stream types emitted by the engine.
pub mod events;
/// Background worker handle and scheduling loop.
pub mod handle;
