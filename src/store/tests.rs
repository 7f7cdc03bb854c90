//! Tests for the storage engines.
//!
//! Behavioral tests run against both engines through the [`Datastore`]
//! trait; redb-specific tests (persistence, failed batches) follow.

use super::*;
use crate::error::Error;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn kv(key: &str, value: &str) -> KeyValue {
    KeyValue::new(key, value)
}

fn set(store: &dyn Datastore, pairs: &[(&str, &str)]) {
    let entries = pairs.iter().map(|(k, v)| kv(k, v)).collect();
    store.set(&SetRequest::new(entries)).unwrap();
}

fn redb_store(tmp: &TempDir) -> RedbStore {
    RedbStore::open(tmp.path().join("test.redb"), &RedbOptions::default()).unwrap()
}

fn small_segments() -> RedbOptions {
    RedbOptions {
        segment_entries: 4,
        ..RedbOptions::default()
    }
}

/// Runs `check` against a fresh instance of every engine.
fn for_each_engine(check: impl Fn(&dyn Datastore)) {
    let tmp = TempDir::new().unwrap();
    check(&redb_store(&tmp));
    check(&MemoryStore::default());
}

// ============================================================================
// Get / Set
// ============================================================================

#[test]
fn test_set_and_get() {
    for_each_engine(|store| {
        set(store, &[("key1", "value1")]);
        let found = store.get(&[GetRequest::key("key1")]).unwrap();
        assert_eq!(found, vec![kv("key1", "value1")]);
    });
}

#[test]
fn test_absent_key_is_omitted() {
    for_each_engine(|store| {
        set(store, &[("a", "1"), ("c", "3")]);
        let found = store
            .get(&[GetRequest::key("a"), GetRequest::key("b"), GetRequest::key("c")])
            .unwrap();
        assert_eq!(found, vec![kv("a", "1"), kv("c", "3")]);
    });
}

#[test]
fn test_results_follow_request_order() {
    for_each_engine(|store| {
        set(store, &[("a", "1"), ("b", "2"), ("x/1", "3")]);
        let found = store
            .get(&[
                GetRequest::key("b"),
                GetRequest::prefix("x/"),
                GetRequest::key("a"),
            ])
            .unwrap();
        assert_eq!(found, vec![kv("b", "2"), kv("x/1", "3"), kv("a", "1")]);
    });
}

#[test]
fn test_prefix_scan_is_ordered_and_bounded() {
    for_each_engine(|store| {
        set(
            store,
            &[("users/2", "b"), ("users/1", "a"), ("usersx", "no"), ("user", "no")],
        );
        let found = store.get(&[GetRequest::prefix("users/")]).unwrap();
        assert_eq!(found, vec![kv("users/1", "a"), kv("users/2", "b")]);
    });
}

#[test]
fn test_empty_prefix_matches_everything() {
    for_each_engine(|store| {
        set(store, &[("b", "2"), ("a", "1")]);
        let found = store.get(&[GetRequest::prefix("")]).unwrap();
        assert_eq!(found, vec![kv("a", "1"), kv("b", "2")]);
    });
}

#[test]
fn test_overwrite_keeps_last_value() {
    for_each_engine(|store| {
        set(store, &[("k", "old")]);
        set(store, &[("k", "new")]);
        assert_eq!(
            store.get(&[GetRequest::key("k")]).unwrap(),
            vec![kv("k", "new")]
        );
    });
}

#[test]
fn test_duplicate_key_in_batch_last_wins() {
    for_each_engine(|store| {
        set(store, &[("k", "first"), ("k", "second")]);
        assert_eq!(
            store.get(&[GetRequest::key("k")]).unwrap(),
            vec![kv("k", "second")]
        );
    });
}

#[test]
fn test_binary_keys_and_empty_values() {
    for_each_engine(|store| {
        let key = vec![0u8, 255, 7];
        store
            .set(&SetRequest::new(vec![KeyValue::new(key.clone(), Vec::new())]))
            .unwrap();
        let found = store.get(&[GetRequest::key(key.clone())]).unwrap();
        assert_eq!(found, vec![KeyValue::new(key, Vec::new())]);
    });
}

#[test]
fn test_empty_batch_is_noop() {
    for_each_engine(|store| {
        store.set(&SetRequest::default()).unwrap();
        assert!(store.get(&[GetRequest::prefix("")]).unwrap().is_empty());
    });
}

// ============================================================================
// TTL
// ============================================================================

#[test]
fn test_ttl_expires_whole_batch() {
    for_each_engine(|store| {
        let batch = SetRequest::new(vec![kv("t/1", "a"), kv("t/2", "b")])
            .with_ttl(Duration::from_millis(50));
        store.set(&batch).unwrap();
        set(store, &[("t/3", "forever")]);

        assert_eq!(store.get(&[GetRequest::prefix("t/")]).unwrap().len(), 3);

        thread::sleep(Duration::from_millis(120));

        assert!(store.get(&[GetRequest::key("t/1")]).unwrap().is_empty());
        assert_eq!(
            store.get(&[GetRequest::prefix("t/")]).unwrap(),
            vec![kv("t/3", "forever")]
        );
    });
}

#[test]
fn test_rewrite_clears_ttl() {
    for_each_engine(|store| {
        store
            .set(&SetRequest::new(vec![kv("k", "v1")]).with_ttl(Duration::from_millis(30)))
            .unwrap();
        set(store, &[("k", "v2")]);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(
            store.get(&[GetRequest::key("k")]).unwrap(),
            vec![kv("k", "v2")]
        );
    });
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscribe_snapshot_then_live() {
    let tmp = TempDir::new().unwrap();
    let store = redb_store(&tmp);
    set(&store, &[("p/1", "a"), ("p/2", "b"), ("q/1", "c")]);

    let mut sub = store.subscribe(&[b"p/".to_vec()]).unwrap();
    assert_eq!(sub.next().await.unwrap(), vec![kv("p/1", "a"), kv("p/2", "b")]);

    set(&store, &[("q/2", "skip"), ("p/3", "live")]);
    assert_eq!(sub.next().await.unwrap(), vec![kv("p/3", "live")]);
    assert!(sub.try_next().unwrap().is_none());
}

#[tokio::test]
async fn test_subscribe_snapshots_every_prefix() {
    for_engine_async(|store| async move {
        set(&*store, &[("a/1", "1"), ("b/1", "2"), ("c/1", "3")]);

        let mut sub = store.subscribe(&[b"c/".to_vec(), b"a/".to_vec()]).unwrap();
        assert_eq!(sub.next().await.unwrap(), vec![kv("a/1", "1")]);
        assert_eq!(sub.next().await.unwrap(), vec![kv("c/1", "3")]);
        assert!(sub.try_next().unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_subscribe_overlapping_prefixes_delivers_once() {
    for_engine_async(|store| async move {
        set(&*store, &[("ab", "1")]);

        let mut sub = store.subscribe(&[b"a".to_vec(), b"ab".to_vec()]).unwrap();
        assert_eq!(sub.prefixes(), &[b"a".to_vec()]);
        assert_eq!(sub.next().await.unwrap(), vec![kv("ab", "1")]);

        set(&*store, &[("abc", "2")]);
        assert_eq!(sub.next().await.unwrap(), vec![kv("abc", "2")]);
        assert!(sub.try_next().unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_subscribe_empty_snapshot() {
    for_engine_async(|store| async move {
        let mut sub = store.subscribe(&[b"none/".to_vec()]).unwrap();
        assert!(sub.try_next().unwrap().is_none());

        set(&*store, &[("none/1", "x")]);
        assert_eq!(sub.next().await.unwrap(), vec![kv("none/1", "x")]);
    })
    .await;
}

#[tokio::test]
async fn test_close_ends_subscriptions() {
    for_engine_async(|store| async move {
        let mut sub = store.subscribe(&[b"".to_vec()]).unwrap();
        store.close();
        assert!(matches!(sub.next().await, Err(Error::Feed(_))));
        assert!(matches!(store.subscribe(&[b"".to_vec()]), Err(Error::Feed(_))));
    })
    .await;
}

#[test]
fn test_concurrent_writers_reach_subscriber_in_commit_order() {
    let tmp = TempDir::new().unwrap();
    let store = std::sync::Arc::new(redb_store(&tmp));
    let mut sub = store.subscribe(&[b"w/".to_vec()]).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let store = std::sync::Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("w/{writer}");
                    store
                        .set(&SetRequest::new(vec![KeyValue::new(key, i.to_string())]))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut last_seen = std::collections::HashMap::new();
    let mut delivered = 0;
    while let Some(batch) = sub.try_next().unwrap() {
        for entry in batch {
            let value: u32 = String::from_utf8(entry.value).unwrap().parse().unwrap();
            let previous = last_seen.insert(entry.key, value);
            assert!(previous.is_none_or(|p| p < value), "out of order delivery");
            delivered += 1;
        }
    }
    assert_eq!(delivered, 100);

    // The last delivered value per key is what the store holds
    for (key, value) in last_seen {
        let found = store.get(&[GetRequest::key(key)]).unwrap();
        assert_eq!(found[0].value, value.to_string().into_bytes());
    }
}

#[test]
fn test_subscribe_during_writes_sees_each_key_once() {
    const KEYS: usize = 200;

    for_each_engine(|store| {
        let mut sub = thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for i in 0..KEYS {
                    let key = format!("p/{i:03}");
                    set(store, &[(key.as_str(), "v")]);
                }
            });

            // Wait until the writer is well under way
            while store.get(&[GetRequest::prefix("p/")]).unwrap().len() < KEYS / 4 {
                thread::yield_now();
            }
            let sub = store.subscribe(&[b"p/".to_vec()]).unwrap();
            writer.join().unwrap();
            sub
        });

        let mut seen = std::collections::HashMap::new();
        while let Some(batch) = sub.try_next().unwrap() {
            for entry in batch {
                *seen.entry(entry.key).or_insert(0) += 1;
            }
        }
        assert_eq!(seen.len(), KEYS, "a write fell between snapshot and feed");
        assert!(seen.values().all(|count| *count == 1), "a write was delivered twice");
    });
}

// ============================================================================
// Reclamation
// ============================================================================

#[test]
fn test_reclaim_empty_store_is_noop() {
    for_each_engine(|store| {
        assert_eq!(store.reclaim(0.5, &StopFlag::new()).unwrap(), Reclaim::NoOp);
    });
}

#[test]
fn test_reclaim_rejects_bad_ratio() {
    for_each_engine(|store| {
        assert!(matches!(
            store.reclaim(-0.1, &StopFlag::new()),
            Err(Error::Validation(_))
        ));
        assert!(store.reclaim(1.01, &StopFlag::new()).is_err());
    });
}

#[test]
fn test_reclaim_removes_expired_entries() {
    let tmp = TempDir::new().unwrap();
    let store = RedbStore::open(tmp.path().join("r.redb"), &small_segments()).unwrap();

    let expiring = (0..8).map(|i| kv(&format!("e/{i}"), "x")).collect();
    store
        .set(&SetRequest::new(expiring).with_ttl(Duration::from_millis(20)))
        .unwrap();
    set(&store, &[("live/1", "keep"), ("live/2", "keep")]);
    thread::sleep(Duration::from_millis(60));

    let outcome = store.reclaim(0.5, &StopFlag::new()).unwrap();
    assert_eq!(
        outcome,
        Reclaim::Reclaimed {
            segments: 2,
            entries: 8
        }
    );

    // Nothing left to reclaim, live data untouched
    assert_eq!(store.reclaim(0.5, &StopFlag::new()).unwrap(), Reclaim::NoOp);
    assert_eq!(store.get(&[GetRequest::prefix("live/")]).unwrap().len(), 2);
}

#[test]
fn test_reclaim_respects_discard_ratio() {
    let store = MemoryStore::new(4, 16);
    store
        .set(&SetRequest::new(vec![kv("a", "x")]).with_ttl(Duration::from_millis(10)))
        .unwrap();
    set(&store, &[("b", "1"), ("c", "2"), ("d", "3")]);
    thread::sleep(Duration::from_millis(40));

    // One stale entry out of four
    assert_eq!(store.reclaim(0.5, &StopFlag::new()).unwrap(), Reclaim::NoOp);
    assert_eq!(store.len(), 4);

    assert_eq!(
        store.reclaim(0.25, &StopFlag::new()).unwrap(),
        Reclaim::Reclaimed {
            segments: 1,
            entries: 1
        }
    );
    assert_eq!(store.len(), 3);
}

#[test]
fn test_reclaim_honours_stop_flag() {
    for_each_engine(|store| {
        store
            .set(&SetRequest::new(vec![kv("a", "x")]).with_ttl(Duration::from_millis(10)))
            .unwrap();
        thread::sleep(Duration::from_millis(40));

        let stop = StopFlag::new();
        stop.stop();
        assert_eq!(store.reclaim(0.0, &stop).unwrap(), Reclaim::NoOp);
    });
}

#[test]
fn test_reclaim_does_not_notify_subscribers() {
    let store = MemoryStore::new(4, 16);
    store
        .set(&SetRequest::new(vec![kv("a", "x")]).with_ttl(Duration::from_millis(10)))
        .unwrap();
    let mut sub = store.subscribe(&[b"a".to_vec()]).unwrap();
    assert_eq!(sub.try_next().unwrap(), Some(vec![kv("a", "x")]));
    thread::sleep(Duration::from_millis(40));

    assert!(!store.reclaim(0.0, &StopFlag::new()).unwrap().is_noop());
    assert!(sub.try_next().unwrap().is_none());
}

// ============================================================================
// redb engine
// ============================================================================

#[test]
fn test_data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("persist.redb");
    {
        let store = RedbStore::open(&path, &RedbOptions::default()).unwrap();
        set(&store, &[("k", "v")]);
    }
    let store = RedbStore::open(&path, &RedbOptions::default()).unwrap();
    assert_eq!(store.get(&[GetRequest::key("k")]).unwrap(), vec![kv("k", "v")]);
}

#[test]
fn test_open_creates_parent_directories() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested/dir/data.redb");
    let store = RedbStore::open(&path, &RedbOptions::default()).unwrap();
    assert_eq!(store.path(), path.as_path());
    assert!(path.exists());
}

#[tokio::test]
async fn test_failed_batch_is_invisible_and_unpublished() {
    let tmp = TempDir::new().unwrap();
    let store = redb_store(&tmp);
    set(&store, &[("b/1", "before")]);
    let mut sub = store.subscribe(&[b"b/".to_vec()]).unwrap();
    assert_eq!(sub.next().await.unwrap(), vec![kv("b/1", "before")]);

    store.fail_writes_after(2);
    let batch = SetRequest::new(vec![kv("b/1", "x"), kv("b/2", "y"), kv("b/3", "z")]);
    let err = store.set(&batch).unwrap_err();
    assert!(matches!(err, Error::Write { .. }), "{err}");

    assert_eq!(
        store.get(&[GetRequest::prefix("b/")]).unwrap(),
        vec![kv("b/1", "before")]
    );
    assert!(sub.try_next().unwrap().is_none());

    store.fail_writes_after(usize::MAX);
    set(&store, &[("b/2", "after")]);
    assert_eq!(sub.next().await.unwrap(), vec![kv("b/2", "after")]);
}

#[test]
fn test_corrupt_entry_is_a_read_error() {
    let tmp = TempDir::new().unwrap();
    let store = redb_store(&tmp);
    store.put_raw(b"bad", b"abc");

    let err = store.get(&[GetRequest::key("bad")]).unwrap_err();
    assert!(matches!(err, Error::Read { .. }));
    assert!(err.to_string().contains("decode entry 'bad'"), "{err}");
    assert!(store.get(&[GetRequest::prefix("b")]).is_err());
}

#[test]
fn test_open_selects_engine() {
    let tmp = TempDir::new().unwrap();
    let mut settings = crate::config::StoreSettings {
        path: Some(tmp.path().join("sel.redb")),
        ..Default::default()
    };
    assert_eq!(open(&settings).unwrap().backend_name(), "redb");

    settings.in_memory = true;
    assert_eq!(open(&settings).unwrap().backend_name(), "memory");

    settings.in_memory = false;
    settings.path = None;
    assert!(matches!(open(&settings), Err(Error::Config(_))));
}

// ============================================================================
// Prefix normalization
// ============================================================================

#[test]
fn test_normalize_prefixes() {
    let input = vec![
        b"b/".to_vec(),
        b"a/x".to_vec(),
        b"a/".to_vec(),
        b"b/".to_vec(),
        b"c".to_vec(),
    ];
    assert_eq!(
        normalize_prefixes(&input),
        vec![b"a/".to_vec(), b"b/".to_vec(), b"c".to_vec()]
    );
    assert_eq!(
        normalize_prefixes(&[b"x".to_vec(), Vec::new()]),
        vec![Vec::<u8>::new()]
    );
}

// ============================================================================
// Helpers
// ============================================================================

async fn for_engine_async<F, Fut>(check: F)
where
    F: Fn(std::sync::Arc<dyn Datastore>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let tmp = TempDir::new().unwrap();
    check(std::sync::Arc::new(redb_store(&tmp))).await;
    check(std::sync::Arc::new(MemoryStore::default())).await;
}
