use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use offsync::{
    core::queue::MutationQueue,
    error::SyncError,
    op::SyncOperation,
    persist::{QueueStore, StorageError, memory::MemoryStore, sqlite::SqliteStore},
    types::{Identity, OpKind, Partition},
};

const CROPS: Partition = Partition::named("crops");

fn ops() -> Vec<SyncOperation> {
    vec![
        SyncOperation::new(
            OpKind::Create,
            "/crops",
            CROPS,
            Identity::Temporary("tmp-a".to_string()),
            Some(json!({ "name": "Rice" })),
            100,
        ),
        SyncOperation::new(
            OpKind::Update,
            "/crops/c1",
            CROPS,
            Identity::canonical("c1"),
            Some(json!({ "id": "c1", "name": "Basmati Rice" })),
            200,
        ),
        SyncOperation::new(OpKind::Delete, "/crops/c2", CROPS, Identity::canonical("c2"), None, 300)
            .with_priority(7),
    ]
}

#[tokio::test]
async fn three_operations_survive_restart_unchanged() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");
    let expected = ops();

    {
        let store: Arc<dyn QueueStore> = Arc::new(SqliteStore::open(&db_path).expect("open sqlite"));
        let mut queue = MutationQueue::load(store, 100).await.expect("load");
        for op in expected.clone() {
            queue.enqueue(op).await.expect("enqueue");
        }
        let first = expected[0].id;
        queue.record_failure(first, 150, "offline").await.expect("failure");
    }

    let store: Arc<dyn QueueStore> = Arc::new(SqliteStore::open(&db_path).expect("reopen sqlite"));
    let queue = MutationQueue::load(store, 100).await.expect("reload");
    let restored = queue.list_pending();

    assert_eq!(restored.len(), 3);
    assert_eq!(restored[0].retry_count, 1);
    assert_eq!(restored[0].last_error.as_deref(), Some("offline"));
    assert_eq!(restored[1], expected[1]);
    assert_eq!(restored[2], expected[2]);
    assert_eq!(restored[2].priority, 7);
    assert_eq!(restored[0].target, Identity::Temporary("tmp-a".to_string()));
}

#[tokio::test]
async fn full_queue_refuses_enqueue() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = MutationQueue::load(store, 2).await.expect("load");
    let mut batch = ops().into_iter();

    queue.enqueue(batch.next().expect("op")).await.expect("first");
    queue.enqueue(batch.next().expect("op")).await.expect("second");
    let err = queue.enqueue(batch.next().expect("op")).await.expect_err("full");

    assert!(matches!(err, SyncError::Backpressure { capacity: 2 }));
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn failed_persist_rolls_back_enqueue() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = MutationQueue::load(store.clone(), 10).await.expect("load");
    store.set_available(false);

    let err = queue.enqueue(ops().remove(0)).await.expect_err("unavailable");
    assert!(matches!(err, SyncError::Storage(StorageError::Unavailable(_))));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn retry_count_never_decreases() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = MutationQueue::load(store, 10).await.expect("load");
    let id = queue.enqueue(ops().remove(1)).await.expect("enqueue");

    queue.update_retry_count(id, 3).await.expect("raise");
    queue.update_retry_count(id, 1).await.expect("lower");
    assert_eq!(queue.get(id).expect("op").retry_count, 3);

    queue.reset_retries(id).await.expect("reset");
    assert_eq!(queue.get(id).expect("op").retry_count, 0);
}

#[tokio::test]
async fn remove_completed_ignores_unknown_ids() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = MutationQueue::load(store.clone(), 10).await.expect("load");
    let all = ops();
    for op in all.clone() {
        queue.enqueue(op).await.expect("enqueue");
    }
    let stranger = ops().remove(0).id;

    let removed = queue
        .remove_completed(&[all[1].id, stranger])
        .await
        .expect("remove");

    assert_eq!(removed, 1);
    let left: Vec<_> = queue.list_pending().into_iter().map(|o| o.id).collect();
    assert_eq!(left, vec![all[0].id, all[2].id]);
    assert_eq!(store.load_queue().expect("load").len(), 2);
}

#[tokio::test]
async fn retarget_rewrites_endpoint_and_payload() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = MutationQueue::load(store, 10).await.expect("load");
    let temp = Identity::Temporary("tmp-a".to_string());
    let update = SyncOperation::new(
        OpKind::Update,
        "/crops/tmp-a",
        CROPS,
        temp.clone(),
        Some(json!({ "id": "tmp-a", "name": "Rice" })),
        10,
    );
    let id = queue.enqueue(update).await.expect("enqueue");
    let canonical = Identity::canonical("srv-7");

    let moved = queue.retarget(&CROPS, &temp, &canonical, "id").await.expect("retarget");

    assert_eq!(moved, vec![id]);
    let op = queue.get(id).expect("op");
    assert_eq!(op.endpoint, "/crops/srv-7");
    assert_eq!(op.target, canonical);
    assert_eq!(op.payload.as_ref().expect("payload")["id"], "srv-7");
    assert_eq!(queue.resolve(&CROPS, &temp), canonical);
}
