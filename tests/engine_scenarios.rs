//! One test per numbered end-to-end scenario in spec §8, exercised only
//! through the public `LsmEngine` API and at the literal scale the spec
//! names (10,000 keys for scenario 3, a 512-byte key / 10 KB value for
//! scenario 4).

use lsm_kv_store::{LsmConfig, LsmEngine};
use rand::Rng;
use std::sync::Arc;
use tempfile::tempdir;

fn open(dir: &std::path::Path, flush_size: usize) -> LsmEngine {
    let config = LsmConfig::builder()
        .dir_path(dir.to_path_buf())
        .memtable_flush_size(flush_size)
        .page_size(4096)
        .max_compaction_threads(2)
        .build()
        .unwrap();
    LsmEngine::open(config).unwrap()
}

/// Scenario 1: open empty dir; put a, put b; get a hits, get c misses.
#[test]
fn scenario_1_basic_put_and_get() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 1_000);

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();

    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), None);
}

/// Scenario 2: repeated puts to the same key, last write wins.
#[test]
fn scenario_2_same_key_overwrite() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 1_000);

    engine.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
    engine.put(b"k".to_vec(), b"v2".to_vec()).unwrap();

    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

/// Scenario 3: 10,000 distinct keys past the flush threshold, at least one
/// SSTable produced, every key readable, and all of it survives a restart.
#[test]
fn scenario_3_ten_thousand_keys_survive_restart() {
    const N: u32 = 10_000;
    let dir = tempdir().unwrap();

    {
        let engine = open(dir.path(), 500);
        for i in 0..N {
            let key = format!("key-{i:05}").into_bytes();
            let value = format!("value-{i:05}").into_bytes();
            engine.put(key, value).unwrap();
        }
        assert!(engine.sstable_count() >= 1);
        for i in 0..N {
            let key = format!("key-{i:05}").into_bytes();
            let expected = format!("value-{i:05}").into_bytes();
            assert_eq!(engine.get(&key).unwrap(), Some(expected));
        }
    }

    let engine = open(dir.path(), 500);
    for i in 0..N {
        let key = format!("key-{i:05}").into_bytes();
        let expected = format!("value-{i:05}").into_bytes();
        assert_eq!(engine.get(&key).unwrap(), Some(expected), "key {i} lost across restart");
    }
}

/// Scenario 4: a 512-byte key with a 10 KB value forces an overflow chain
/// all the way through the engine, not just the Pager directly.
#[test]
fn scenario_4_large_key_and_value_round_trip() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 1_000);

    let key = vec![b'k'; 512];
    let value = vec![b'v'; 10 * 1024];

    engine.put(key.clone(), value.clone()).unwrap();
    assert_eq!(engine.get(&key).unwrap(), Some(value.clone()));

    engine.flush().unwrap();
    assert_eq!(engine.get(&key).unwrap(), Some(value));
}

/// Scenario 5: put, delete, compact; the key is gone from both `get` and
/// any surviving SSTable's range scan.
#[test]
fn scenario_5_delete_then_compact_drops_the_tombstone() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 4);

    // Seed an older SSTable so the delete's flush isn't the only table, and
    // compaction actually has a pair to merge.
    for i in 0..4u32 {
        engine
            .put(format!("seed-{i}").into_bytes(), b"v".to_vec())
            .unwrap();
    }
    engine.flush().unwrap();

    engine.put(b"x".to_vec(), b"v".to_vec()).unwrap();
    engine.delete(b"x".to_vec()).unwrap();
    engine.flush().unwrap();

    engine.compact().unwrap();

    assert_eq!(engine.get(b"x").unwrap(), None);
    let scanned = engine.range(b"a", b"z").unwrap();
    assert!(scanned.iter().all(|(k, _)| k != b"x"));
}

/// Scenario 6: 10 threads each doing 100 puts to their own keys, concurrent
/// with each other; every key ends up holding that thread's last write.
#[test]
fn scenario_6_concurrent_writers_no_crashes() {
    const THREADS: u32 = 10;
    const PUTS_PER_THREAD: u32 = 100;

    let dir = tempdir().unwrap();
    let engine = Arc::new(open(dir.path(), 64));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut last = Vec::new();
                for i in 0..PUTS_PER_THREAD {
                    let key = format!("thread-{tid}").into_bytes();
                    let value: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
                    engine.put(key, value.clone()).unwrap();
                    if i == PUTS_PER_THREAD - 1 {
                        last = value;
                    }
                }
                (tid, last)
            })
        })
        .collect();

    for handle in handles {
        let (tid, expected) = handle.join().unwrap();
        let key = format!("thread-{tid}").into_bytes();
        assert_eq!(engine.get(&key).unwrap(), Some(expected));
    }
}
