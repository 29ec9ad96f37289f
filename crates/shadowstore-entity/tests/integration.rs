//! End-to-end tests exercising the entity store across restarts

use std::time::Duration;

use shadowstore_core::{Config, DataBlock};
use shadowstore_entity::EntityStore;
use tempfile::TempDir;

fn record(identity: &str, payload: &[u8], version: u64) -> DataBlock {
    DataBlock::new(identity, payload.to_vec(), version, 1)
}

#[test]
fn test_bulk_insert_delete_and_restart() {
    let tmp = TempDir::new().unwrap();
    let config = Config::default();

    {
        let store = EntityStore::open(tmp.path(), &config).unwrap();

        let new: Vec<DataBlock> = (0..100)
            .map(|i| record(&format!("entity/{}", i), format!("payload-{}", i).as_bytes(), 1))
            .collect();
        store.prepare(new, vec![], vec![]).unwrap().commit().unwrap();

        let removed: Vec<String> = (50..60).map(|i| format!("entity/{}", i)).collect();
        store.prepare(vec![], vec![], removed).unwrap().commit().unwrap();

        store.close().unwrap();
    }

    let store = EntityStore::open(tmp.path(), &config).unwrap();

    let seven = store.get("entity/7").unwrap().unwrap();
    assert_eq!(seven.payload, b"payload-7");
    assert_eq!(seven.instance_version, 1);
    assert!(store.get("entity/55").unwrap().is_none());

    assert_eq!(store.identities().unwrap().len(), 90);
    store.close().unwrap();
}

#[test]
fn test_cancel_restores_every_kind_of_change() {
    let tmp = TempDir::new().unwrap();
    let store = EntityStore::open(tmp.path(), &Config::default()).unwrap();

    store
        .prepare(
            vec![record("keep/a", b"a1", 1), record("drop/b", b"b1", 1)],
            vec![],
            vec![],
        )
        .unwrap()
        .commit()
        .unwrap();

    // One change set touching an update, an insert and a removal, cancelled
    let committer = store
        .prepare(
            vec![record("fresh/c", b"c1", 1)],
            vec![record("keep/a", b"a2", 2)],
            vec!["drop/b".to_string()],
        )
        .unwrap();
    committer.cancel().unwrap();

    let a = store.get("keep/a").unwrap().unwrap();
    assert_eq!(a.payload, b"a1");
    assert_eq!(a.instance_version, 1);
    assert_eq!(store.get("drop/b").unwrap().unwrap().payload, b"b1");
    assert!(store.get("fresh/c").unwrap().is_none());

    store.close().unwrap();
}

#[test]
fn test_unfinished_change_set_rolled_back_on_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = Config::default();

    {
        let store = EntityStore::open(tmp.path(), &config).unwrap();
        store
            .prepare(vec![record("doc/1", b"v1", 1)], vec![], vec![])
            .unwrap()
            .commit()
            .unwrap();

        // Prepare an update but never commit or cancel; dropping the store
        // here stands in for a crash
        let committer = store
            .prepare(vec![], vec![record("doc/1", b"v2", 2)], vec![])
            .unwrap();
        drop(committer);
        drop(store);
    }

    let store = EntityStore::open(tmp.path(), &config).unwrap();
    let doc = store.get("doc/1").unwrap().unwrap();
    assert_eq!(doc.payload, b"v1");
    assert_eq!(doc.instance_version, 1);
    store.close().unwrap();
}

#[test]
fn test_committed_changes_survive_unclean_shutdown() {
    let tmp = TempDir::new().unwrap();
    let config = Config::default();

    {
        let store = EntityStore::open(tmp.path(), &config).unwrap();
        store
            .prepare(vec![record("doc/1", b"durable", 3)], vec![], vec![])
            .unwrap()
            .commit()
            .unwrap();
        // No close: the next open has to rebuild the index from the heap
        drop(store);
    }

    let store = EntityStore::open(tmp.path(), &config).unwrap();
    let doc = store.get("doc/1").unwrap().unwrap();
    assert_eq!(doc.payload, b"durable");
    assert_eq!(doc.instance_version, 3);
    store.close().unwrap();
}

#[test]
fn test_removing_unknown_identity_is_silent() {
    let tmp = TempDir::new().unwrap();
    let store = EntityStore::open(tmp.path(), &Config::default()).unwrap();

    store
        .prepare(vec![], vec![], vec!["never/was".to_string()])
        .unwrap()
        .commit()
        .unwrap();
    assert!(store.get("never/was").unwrap().is_none());
    store.close().unwrap();
}

#[test]
fn test_failed_change_set_leaves_store_unchanged() {
    let tmp = TempDir::new().unwrap();
    let store = EntityStore::open(tmp.path(), &Config::default()).unwrap();

    store
        .prepare(vec![record("ok/1", b"v1", 1)], vec![], vec![])
        .unwrap()
        .commit()
        .unwrap();

    let over_long = "x".repeat(200);
    let result = store.prepare(
        vec![record(&over_long, b"nope", 1)],
        vec![record("ok/1", b"v2", 2)],
        vec![],
    );
    assert!(result.is_err());
    // Release the prepare lock before touching the store again
    drop(result);

    assert_eq!(store.get("ok/1").unwrap().unwrap().payload, b"v1");
    store.close().unwrap();
}

#[test]
fn test_collision_heavy_configuration() {
    let tmp = TempDir::new().unwrap();
    // A tiny primary table forces nearly every identity through the
    // overflow buckets
    let config = Config {
        min_index_entries: 4,
        bucket_evict_interval: Duration::from_millis(50),
        ..Config::default()
    };

    {
        let store = EntityStore::open(tmp.path(), &config).unwrap();
        let new: Vec<DataBlock> = (0..200)
            .map(|i| record(&format!("key/{}", i), format!("value-{}", i).as_bytes(), 1))
            .collect();
        store.prepare(new, vec![], vec![]).unwrap().commit().unwrap();

        for i in (0..200).step_by(17) {
            let block = store.get(&format!("key/{}", i)).unwrap().unwrap();
            assert_eq!(block.payload, format!("value-{}", i).as_bytes());
        }
        store.close().unwrap();
    }

    let store = EntityStore::open(tmp.path(), &config).unwrap();
    assert_eq!(store.identities().unwrap().len(), 200);
    assert_eq!(store.get("key/123").unwrap().unwrap().payload, b"value-123");
    store.close().unwrap();
}
