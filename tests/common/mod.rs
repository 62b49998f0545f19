#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use offsync::{
    clock::ManualClock,
    config::{EngineConfig, PartitionSpec},
    connectivity::ConnectivityMonitor,
    core::{queue::MutationQueue, repository::CacheRepository},
    persist::memory::MemoryStore,
    record::Payload,
    runtime::coordinator::SyncCoordinator,
    transport::{Transport, TransportError},
    types::{Partition, Verb},
};

pub const CROPS: Partition = Partition::named("crops");
pub const WEATHER: Partition = Partition::named("weather");

pub const START_MS: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub verb: Verb,
    pub endpoint: String,
    pub payload: Option<Payload>,
}

/// Transport that records every call and answers from a script.
///
/// Scripted answers are consumed first; afterwards creates echo the payload
/// with a fresh `srv-N` id and every other call echoes its payload.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<Result<Payload, TransportError>>>,
    next_id: Mutex<u64>,
    always_fail: Mutex<Option<TransportError>>,
    on_call: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, answer: Result<Payload, TransportError>) {
        self.script.lock().expect("lock").push_back(answer);
    }

    pub fn fail_always(&self, err: TransportError) {
        *self.always_fail.lock().expect("lock") = Some(err);
    }

    pub fn recover(&self) {
        *self.always_fail.lock().expect("lock") = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock") = Some(delay);
    }

    /// Runs `hook` with the 1-based call number before answering.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_call.lock().expect("lock") = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.endpoint).collect()
    }

    /// Most calls that were ever in progress at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn answer(&self, verb: Verb, payload: Option<&Payload>) -> Result<Payload, TransportError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let answer = self.answer(verb, payload).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, verb: Verb, endpoint: &str, payload: Option<&Payload>) -> Result<Payload, TransportError> {
        let n = {
            let mut calls = self.calls.lock().expect("lock");
            calls.push(Call {
                verb,
                endpoint: endpoint.to_string(),
                payload: payload.cloned(),
            });
            calls.len()
        };
        if let Some(hook) = self.on_call.lock().expect("lock").as_ref() {
            hook(n);
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let answer = self.answer(verb, payload).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
        .with_partition(PartitionSpec::durable(CROPS))
        .with_partition(PartitionSpec::read_through(WEATHER, Duration::from_secs(7 * 24 * 3600)))
}

/// Coordinator over a memory store, plus the pieces tests poke at.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<ScriptedTransport>,
    pub monitor: ConnectivityMonitor,
    pub clock: ManualClock,
    pub coordinator: Arc<SyncCoordinator>,
}

impl Harness {
    pub async fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(config: EngineConfig, store: Arc<MemoryStore>) -> Self {
        let transport = ScriptedTransport::new();
        let monitor = ConnectivityMonitor::new(true);
        let clock = ManualClock::new(START_MS);
        let (events, _) = tokio::sync::broadcast::channel(256);
        let repository = Arc::new(
            CacheRepository::new(store.clone(), config.partitions.clone(), Arc::new(clock.clone()))
                .with_events(events.clone()),
        );
        let queue = MutationQueue::load(store.clone(), config.queue_capacity)
            .await
            .expect("load queue");
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(AsyncMutex::new(queue)),
            repository,
            transport.clone(),
            monitor.observer(),
            Arc::new(clock.clone()),
            config,
            events,
        ));
        Self {
            store,
            transport,
            monitor,
            clock,
            coordinator,
        }
    }
}
