mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use offsync::{
    clock::ManualClock,
    config::EngineConfig,
    connectivity::ConnectivityMonitor,
    engine::SyncEngine,
    persist::sqlite::SqliteStore,
    runtime::{coordinator::SyncReport, events::SyncEvent},
    types::{Identity, Verb},
};

use common::{CROPS, START_MS, ScriptedTransport, config};

async fn next_finished(events: &mut broadcast::Receiver<SyncEvent>) -> SyncReport {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("recv");
        if let SyncEvent::PassFinished(report) = event {
            if report.attempted > 0 {
                return report;
            }
        }
    }
}

async fn open(
    db: &std::path::Path,
    cfg: EngineConfig,
    transport: Arc<ScriptedTransport>,
    monitor: &ConnectivityMonitor,
    clock: &ManualClock,
) -> SyncEngine {
    SyncEngine::open(
        cfg,
        Arc::new(SqliteStore::open(db).expect("open sqlite")),
        transport,
        monitor.observer(),
        Arc::new(clock.clone()),
    )
    .await
    .expect("open engine")
}

#[tokio::test]
async fn offline_edit_drains_after_reconnect() {
    let tmp = TempDir::new().expect("tmp");
    let transport = ScriptedTransport::new();
    let monitor = ConnectivityMonitor::new(true);
    let clock = ManualClock::new(START_MS);
    let mut engine = open(&tmp.path().join("app.db"), config(), transport.clone(), &monitor, &clock).await;
    let c1 = Identity::canonical("c1");
    engine
        .repository()
        .put(&CROPS, c1.clone(), json!({ "id": "c1", "name": "Rice" }))
        .await
        .expect("seed");

    let handle = engine.start();
    let mut events = handle.subscribe();
    monitor.set_online(false);
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine
        .writer()
        .update(&CROPS, "/crops", &c1, json!({ "id": "c1", "name": "Basmati Rice" }))
        .await
        .expect("offline update");

    let pending = engine.coordinator().queue().lock().await.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/crops/c1");
    let cached = engine.repository().get(&CROPS, "c1").await.expect("get").expect("c1");
    assert_eq!(cached.payload["name"], "Basmati Rice");
    let before = handle.status().await.expect("status").last_sync_ms;

    clock.advance(Duration::from_secs(30));
    monitor.set_online(true);
    let report = next_finished(&mut events).await;

    assert_eq!(report.succeeded, 1);
    let status = handle.status().await.expect("status");
    assert_eq!(status.pending_operations, 0);
    assert!(status.last_sync_ms > before);
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].verb, Verb::Replace);
    assert_eq!(calls[0].endpoint, "/crops/c1");
    assert_eq!(calls[0].payload.as_ref().expect("payload")["name"], "Basmati Rice");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn queued_create_survives_restart_and_reconciles() {
    let tmp = TempDir::new().expect("tmp");
    let db = tmp.path().join("app.db");
    let transport = ScriptedTransport::new();
    let clock = ManualClock::new(START_MS);

    let temp = {
        let monitor = ConnectivityMonitor::new(false);
        let engine = open(&db, config(), transport.clone(), &monitor, &clock).await;
        let created = engine
            .writer()
            .create(&CROPS, "/crops", json!({ "name": "Quinoa" }))
            .await
            .expect("create");
        created.record().id.clone()
    };

    let monitor = ConnectivityMonitor::new(true);
    let engine = open(&db, config(), transport.clone(), &monitor, &clock).await;
    assert_eq!(engine.coordinator().status().await.pending_operations, 1);
    assert!(engine.repository().get(&CROPS, temp.key()).await.expect("get").is_some());

    let report = engine.coordinator().sync(false).await;

    assert_eq!(report.reconciled, 1);
    assert!(engine.repository().get(&CROPS, temp.key()).await.expect("get").is_none());
    let record = engine
        .repository()
        .get(&CROPS, "srv-1")
        .await
        .expect("get")
        .expect("reconciled");
    assert_eq!(record.payload, json!({ "id": "srv-1", "name": "Quinoa" }));
}

#[tokio::test]
async fn online_write_nudges_worker() {
    let tmp = TempDir::new().expect("tmp");
    let transport = ScriptedTransport::new();
    let monitor = ConnectivityMonitor::new(true);
    let clock = ManualClock::new(START_MS);
    let mut engine = open(&tmp.path().join("app.db"), config(), transport.clone(), &monitor, &clock).await;
    let handle = engine.start();
    let mut events = handle.subscribe();

    transport.push(Err(offsync::transport::TransportError::Offline));
    engine
        .writer()
        .update(&CROPS, "/crops", &Identity::canonical("c9"), json!({ "id": "c9" }))
        .await
        .expect("update");

    let report = next_finished(&mut events).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.calls().len(), 2);
    handle.shutdown().await.expect("shutdown");
}
