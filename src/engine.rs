//! One-call wiring of store, queue, coordinator, writer and worker.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};

use crate::{
    clock::Clock,
    config::EngineConfig,
    connectivity::Connectivity,
    core::{queue::MutationQueue, repository::CacheRepository},
    error::SyncResult,
    persist::{QueueStore, RecordStore},
    runtime::{
        coordinator::SyncCoordinator,
        events::SyncEvent,
        handle::{SyncHandle, spawn_sync_engine},
    },
    transport::Transport,
    writer::OfflineWriter,
};

/// Assembled sync engine.
///
/// `open` restores the persisted queue and wires every component against a
/// single store. `start` spawns the background worker; until then passes
/// only run when [`SyncCoordinator::sync`] is called directly.
pub struct SyncEngine {
    repository: Arc<CacheRepository>,
    coordinator: Arc<SyncCoordinator>,
    writer: OfflineWriter,
    handle: Option<SyncHandle>,
}

impl SyncEngine {
    /// Builds an engine over `store`, which backs both records and queue.
    pub async fn open<S>(
        config: EngineConfig,
        store: Arc<S>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self>
    where
        S: RecordStore + QueueStore + 'static,
    {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let records: Arc<dyn RecordStore> = store.clone();
        let repository = Arc::new(
            CacheRepository::new(records, config.partitions.clone(), Arc::clone(&clock))
                .with_events(events.clone()),
        );

        let queue_store: Arc<dyn QueueStore> = store;
        let queue = MutationQueue::load(queue_store, config.queue_capacity).await?;
        let queue = Arc::new(Mutex::new(queue));

        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&repository),
            Arc::clone(&transport),
            connectivity.clone(),
            Arc::clone(&clock),
            config.clone(),
            events,
        ));
        let writer = OfflineWriter::new(
            Arc::clone(&repository),
            queue,
            transport,
            connectivity,
            clock,
            config,
        );

        Ok(Self {
            repository,
            coordinator,
            writer,
            handle: None,
        })
    }

    /// Spawns the background worker, or returns the running one.
    pub fn start(&mut self) -> SyncHandle {
        if let Some(handle) = &self.handle {
            return handle.clone();
        }
        let handle = spawn_sync_engine(Arc::clone(&self.coordinator));
        self.writer.set_trigger(handle.clone());
        self.handle = Some(handle.clone());
        handle
    }

    /// Worker handle, once started.
    pub fn handle(&self) -> Option<&SyncHandle> {
        self.handle.as_ref()
    }

    /// Cache repository.
    pub fn repository(&self) -> &Arc<CacheRepository> {
        &self.repository
    }

    /// Write path.
    pub fn writer(&self) -> &OfflineWriter {
        &self.writer
    }

    /// Drain-pass coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }
}
