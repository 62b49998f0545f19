use serde_json::json;
use tempfile::TempDir;

use offsync::{
    persist::{RecordStore, StorageError, sqlite::SqliteStore},
    record::CacheRecord,
    types::{Identity, Partition},
};

const CROPS: Partition = Partition::named("crops");
const FIELDS: Partition = Partition::named("fields");

fn record(partition: Partition, key: &str, name: &str, ts: u64) -> CacheRecord {
    CacheRecord::new(
        partition,
        Identity::canonical(key),
        json!({ "id": key, "name": name }),
        ts,
    )
}

#[test]
fn put_get_delete_round_trip() {
    let store = SqliteStore::open_in_memory().expect("open sqlite");

    store.put(&record(CROPS, "c2", "Maize", 1)).expect("put c2");
    store.put(&record(CROPS, "c1", "Rice", 2)).expect("put c1");
    store.put(&record(CROPS, "c1", "Basmati Rice", 3)).expect("overwrite c1");

    let c1 = store.get(&CROPS, "c1").expect("get").expect("c1");
    assert_eq!(c1.payload["name"], "Basmati Rice");
    assert_eq!(c1.last_updated_ms, 3);

    let keys: Vec<String> = store
        .get_all(&CROPS)
        .expect("get_all")
        .into_iter()
        .map(|r| r.key().to_string())
        .collect();
    assert_eq!(keys, vec!["c1", "c2"]);

    assert!(store.delete(&CROPS, "c1").expect("delete"));
    assert!(!store.delete(&CROPS, "c1").expect("delete again"));
    assert!(store.get(&CROPS, "c1").expect("get").is_none());
}

#[test]
fn partitions_are_isolated() {
    let store = SqliteStore::open_in_memory().expect("open sqlite");
    store.put(&record(CROPS, "x", "crop", 1)).expect("put crop");
    store.put(&record(FIELDS, "x", "field", 1)).expect("put field");

    assert_eq!(store.get(&CROPS, "x").expect("get").expect("crop").payload["name"], "crop");
    assert_eq!(store.get(&FIELDS, "x").expect("get").expect("field").payload["name"], "field");
}

#[test]
fn put_many_is_all_or_nothing() {
    let store = SqliteStore::open_in_memory().expect("open sqlite");
    let batch = vec![record(CROPS, "a", "A", 1), record(FIELDS, "b", "B", 1)];

    let err = store.put_many(&CROPS, &batch).expect_err("mixed partitions");
    assert!(matches!(err, StorageError::PartitionMismatch { .. }));
    assert!(store.get_all(&CROPS).expect("get_all").is_empty());

    let batch = vec![record(CROPS, "a", "A", 1), record(CROPS, "b", "B", 1)];
    store.put_many(&CROPS, &batch).expect("put_many");
    assert_eq!(store.get_all(&CROPS).expect("get_all").len(), 2);
}

#[test]
fn temporary_identity_survives_reopen() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("cache.db");

    {
        let store = SqliteStore::open(&db_path).expect("open sqlite");
        let temp = CacheRecord::new(
            CROPS,
            Identity::Temporary("tmp-1".to_string()),
            json!({ "id": "tmp-1", "name": "Sorghum" }),
            10,
        );
        store.put(&temp).expect("put");
        store.flush().expect("flush");
    }

    let store = SqliteStore::open(&db_path).expect("reopen sqlite");
    let loaded = store.get(&CROPS, "tmp-1").expect("get").expect("record");
    assert!(loaded.id.is_temporary());
    assert_eq!(loaded.payload["name"], "Sorghum");
}

#[test]
fn rekey_moves_record_atomically() {
    let store = SqliteStore::open_in_memory().expect("open sqlite");
    let temp = Identity::Temporary("temp-1".to_string());
    let original = CacheRecord::new(CROPS, temp.clone(), json!({ "id": "temp-1", "name": "Rice" }), 1);
    store.put(&original).expect("put");

    let moved = original.rekeyed(Identity::canonical("srv-42"), "id", 2);
    assert!(store.rekey(&CROPS, &temp, &moved).expect("rekey"));
    assert!(store.get(&CROPS, "temp-1").expect("get").is_none());
    let loaded = store.get(&CROPS, "srv-42").expect("get").expect("record");
    assert_eq!(loaded.payload, json!({ "id": "srv-42", "name": "Rice" }));
    assert!(!loaded.id.is_temporary());

    assert!(!store.rekey(&CROPS, &temp, &moved).expect("second rekey"));
}

#[test]
fn delete_older_than_keeps_temporary_records() {
    let store = SqliteStore::open_in_memory().expect("open sqlite");
    store.put(&record(CROPS, "old", "old", 100)).expect("put old");
    store.put(&record(CROPS, "fresh", "fresh", 1_000)).expect("put fresh");
    store
        .put(&CacheRecord::new(
            CROPS,
            Identity::Temporary("tmp-old".to_string()),
            json!({}),
            100,
        ))
        .expect("put temp");

    let removed = store.delete_older_than(&CROPS, 500).expect("sweep");
    assert_eq!(removed, 1);
    let keys: Vec<String> = store
        .get_all(&CROPS)
        .expect("get_all")
        .into_iter()
        .map(|r| r.key().to_string())
        .collect();
    assert_eq!(keys, vec!["fresh", "tmp-old"]);
}
