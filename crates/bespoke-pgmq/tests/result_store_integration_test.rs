//! Integration tests for `PostgresResultStore` against a real Postgres
//! instance, gated on `DATABASE_URL` (see `tests/common`).

mod common;

use common::TestDb;

use bespoke_pgmq::PostgresResultStore;
use bespoke_shared::store::ResultStore;

fn key(test_id: &str, suffix: &str) -> String {
    format!("{test_id}/{suffix}")
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let k = key(&test_db.test_id, "sub/1");
    store.put(&k, b"hello").await.expect("put");
    assert_eq!(store.get(&k).await.expect("get"), Some(b"hello".to_vec()));
}

#[tokio::test]
async fn get_missing_key_is_none() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let k = key(&test_db.test_id, "sub/missing");
    assert_eq!(store.get(&k).await.expect("get"), None);
}

#[tokio::test]
async fn compare_and_set_rejects_stale_expectation() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let k = key(&test_db.test_id, "cache/fp1");
    store.put(&k, b"v1").await.expect("put");
    let applied = store.compare_and_set(&k, Some(b"wrong"), b"v2").await.expect("cas");
    assert!(!applied);
    assert_eq!(store.get(&k).await.expect("get"), Some(b"v1".to_vec()));
}

#[tokio::test]
async fn compare_and_set_requires_absence_for_none_expectation() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let k = key(&test_db.test_id, "lease/fp1");
    assert!(store.compare_and_set(&k, None, b"owner-a").await.expect("cas first"));
    assert!(!store.compare_and_set(&k, None, b"owner-b").await.expect("cas second"));
}

#[tokio::test]
async fn scan_prefix_finds_matching_keys() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let prefix = format!("{}/stage/1/", test_db.test_id);
    store.put(&format!("{prefix}0"), b"a").await.expect("put");
    store.put(&format!("{prefix}1"), b"b").await.expect("put");
    store.put(&format!("{}/stage/2/0", test_db.test_id), b"c").await.expect("put");

    let mut keys = store.scan_prefix(&prefix).await.expect("scan");
    keys.sort();
    assert_eq!(keys, vec![format!("{prefix}0"), format!("{prefix}1")]);
}

#[tokio::test]
async fn next_sequence_is_monotonic() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let store = PostgresResultStore::new_with_pool(test_db.pool.clone()).await.expect("connect");
    let name = format!("seq-{}", test_db.test_id);
    assert_eq!(store.next_sequence(&name).await.expect("seq 1"), 1);
    assert_eq!(store.next_sequence(&name).await.expect("seq 2"), 2);
    assert_eq!(store.next_sequence(&name).await.expect("seq 3"), 3);
}
