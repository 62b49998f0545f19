//! Offline-first local cache with a durable mutation queue and a sync
//! coordinator that drains it when connectivity returns.
//!
//! # Examples
//!
//! Offline writes land in the cache at once and wait in the queue:
//! ```
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use offsync::{
//!     clock::SystemClock,
//!     config::{EngineConfig, PartitionSpec},
//!     connectivity::ConnectivityMonitor,
//!     engine::SyncEngine,
//!     persist::sqlite::SqliteStore,
//!     record::Payload,
//!     transport::{Transport, TransportError},
//!     types::{Partition, Verb},
//! };
//!
//! struct Unreachable;
//!
//! #[async_trait]
//! impl Transport for Unreachable {
//!     async fn send(&self, _: Verb, _: &str, _: Option<&Payload>) -> Result<Payload, TransportError> {
//!         Err(TransportError::Offline)
//!     }
//! }
//!
//! const CROPS: Partition = Partition::named("crops");
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::default().with_partition(PartitionSpec::durable(CROPS));
//! let monitor = ConnectivityMonitor::new(false);
//! let engine = SyncEngine::open(
//!     config,
//!     Arc::new(SqliteStore::open_in_memory().expect("open sqlite")),
//!     Arc::new(Unreachable),
//!     monitor.observer(),
//!     Arc::new(SystemClock),
//! )
//! .await
//! .expect("open engine");
//!
//! let outcome = engine
//!     .writer()
//!     .create(&CROPS, "/crops", serde_json::json!({ "name": "Rice" }))
//!     .await
//!     .expect("create");
//! assert!(outcome.op_id().is_some());
//! assert_eq!(engine.coordinator().status().await.pending_operations, 1);
//! # }
//! ```
#![warn(missing_docs)]

/// Injected time source.
pub mod clock;
/// Engine configuration and partition registry.
pub mod config;
/// Online/offline signal.
pub mod connectivity;
/// Cache repository and mutation queue.
pub mod core;
/// Assembled engine facade.
pub mod engine;
/// Engine error taxonomy.
pub mod error;
/// Sync operation model and queue envelope.
pub mod op;
/// Storage abstraction with SQLite and in-memory backends.
pub mod persist;
/// Cached record model.
pub mod record;
/// Sync coordinator, background worker and events.
pub mod runtime;
/// Remote transport contract.
pub mod transport;
/// Shared primitive types and enums.
pub mod types;
/// Offline-aware write path.
pub mod writer;
