//! Tests for Store
//!
//! These tests verify:
//! - Point operations (put/get/get_into/exists/delete)
//! - A large sequential load with random deletes and re-inserts
//! - Admission control against the memory limit
//! - Version pins and point-in-time reads
//! - Statistics, flush and dispose
//! - Concurrent writers and readers

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use atlasmap::{AtlasError, CodecKind, Store, StoreConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// =============================================================================
// Helper Functions
// =============================================================================

fn default_store() -> Store {
    Store::new(StoreConfig::default()).unwrap()
}

fn small_block_store(codec: CodecKind) -> Store {
    let config = StoreConfig::builder()
        .block_size(512)
        .index_node_size(512)
        .codec(codec)
        .build();
    Store::new(config).unwrap()
}

fn key(i: u64) -> Vec<u8> {
    format!("KEY{}", i).into_bytes()
}

fn value(i: u64) -> Vec<u8> {
    format!("VALUE{}", i).into_bytes()
}

fn load(store: &Store, range: std::ops::RangeInclusive<u64>) {
    for i in range {
        assert!(store.put(&key(i), &value(i)).unwrap(), "put {} refused", i);
    }
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_round_trip() {
    let store = default_store();

    assert!(store.put(b"alpha", b"one").unwrap());
    assert!(store.put(b"beta", b"two").unwrap());

    assert_eq!(store.get(b"alpha").unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get(b"beta").unwrap(), Some(b"two".to_vec()));
    assert_eq!(store.get(b"gamma").unwrap(), None);
}

#[test]
fn test_overwrite_returns_latest() {
    let store = default_store();

    store.put(b"k", b"first").unwrap();
    store.put(b"k", b"second").unwrap();

    assert_eq!(store.get(b"k").unwrap(), Some(b"second".to_vec()));
    assert_eq!(store.count_records().unwrap(), 1);
    assert_eq!(store.stats().record_count, 1);
}

#[test]
fn test_empty_key_and_value() {
    let store = default_store();

    assert!(store.put(b"", b"empty key").unwrap());
    assert!(store.put(b"empty value", b"").unwrap());

    assert_eq!(store.get(b"").unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(store.get(b"empty value").unwrap(), Some(Vec::new()));
}

#[test]
fn test_get_into_reports_true_length() {
    let store = default_store();
    store.put(b"k", b"0123456789").unwrap();

    let mut small = [0u8; 4];
    assert_eq!(store.get_into(b"k", &mut small).unwrap(), Some(10));
    assert_eq!(&small, b"0123");

    let mut exact = [0u8; 10];
    assert_eq!(store.get_into(b"k", &mut exact).unwrap(), Some(10));
    assert_eq!(&exact, b"0123456789");

    let mut untouched = [0xEEu8; 4];
    assert_eq!(store.get_into(b"missing", &mut untouched).unwrap(), None);
    assert_eq!(untouched, [0xEE; 4]);
}

#[test]
fn test_exists_and_delete() {
    let store = default_store();
    store.put(b"k", b"v").unwrap();

    assert!(store.exists(b"k").unwrap());
    assert!(store.delete(b"k").unwrap());
    assert!(!store.exists(b"k").unwrap());
    assert_eq!(store.get(b"k").unwrap(), None);

    assert!(!store.delete(b"k").unwrap());
    assert!(!store.delete(b"never written").unwrap());
}

#[test]
fn test_put_after_delete_resurrects() {
    let store = default_store();
    store.put(b"k", b"old").unwrap();
    store.delete(b"k").unwrap();
    store.put(b"k", b"new").unwrap();

    assert_eq!(store.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_large_values_and_keys() {
    let store = default_store();
    let big_value = vec![0x5Au8; 100_000];
    let big_key = vec![b'K'; 5_000];

    assert!(store.put(b"big value", &big_value).unwrap());
    assert!(store.put(&big_key, b"small").unwrap());
    load(&store, 1..=500);

    assert_eq!(store.get(b"big value").unwrap(), Some(big_value));
    assert_eq!(store.get(&big_key).unwrap(), Some(b"small".to_vec()));
    assert_eq!(store.count_records().unwrap(), 502);
}

// =============================================================================
// Bulk Workload Tests
// =============================================================================

#[test]
fn test_sequential_load_with_random_deletes() {
    const COUNT: u64 = 100_000;
    let store = default_store();
    load(&store, 1..=COUNT);

    let mut rng = StdRng::seed_from_u64(42);
    let mut deleted = BTreeSet::new();
    for i in 1..=COUNT {
        if rng.gen_bool(0.1) {
            assert!(store.delete(&key(i)).unwrap());
            deleted.insert(i);
        }
    }
    assert!(!deleted.is_empty());

    for i in 1..=COUNT {
        let got = store.get(&key(i)).unwrap();
        if deleted.contains(&i) {
            assert_eq!(got, None, "KEY{} should be deleted", i);
        } else {
            assert_eq!(got, Some(value(i)), "KEY{} lost", i);
        }
    }
    assert_eq!(store.count_records().unwrap(), COUNT - deleted.len() as u64);

    for &i in &deleted {
        assert!(store.put(&key(i), &value(i)).unwrap());
    }

    let mut previous: Option<Vec<u8>> = None;
    let mut seen = 0u64;
    for item in store.scanner(None, None, false) {
        let (k, v) = item.unwrap();
        if let Some(p) = &previous {
            assert!(p.as_slice() < &k[..], "scanner went backwards");
        }
        let i: u64 = std::str::from_utf8(&k[3..]).unwrap().parse().unwrap();
        assert_eq!(&v[..], value(i).as_slice());
        previous = Some(k.to_vec());
        seen += 1;
    }
    assert_eq!(seen, COUNT);

    let stats = store.stats();
    assert!(stats.block_count > 1);
    assert!(stats.depth >= 2);
}

#[test]
fn test_small_blocks_with_compression() {
    for codec in [CodecKind::None, CodecKind::Lz4, CodecKind::Zstd] {
        let store = small_block_store(codec);
        load(&store, 1..=3_000);
        for i in (1..=3_000).step_by(3) {
            assert!(store.delete(&key(i)).unwrap());
        }

        for i in 1..=3_000u64 {
            let expected = if i % 3 == 1 { None } else { Some(value(i)) };
            assert_eq!(store.get(&key(i)).unwrap(), expected, "{} KEY{}", codec, i);
        }
        assert_eq!(store.count_records().unwrap(), 2_000);

        let stats = store.stats();
        if codec != CodecKind::None {
            assert!(stats.compressed_blocks > 0, "{} compressed nothing", codec);
            assert!(stats.compressed_size < stats.data_size);
        }
    }
}

#[test]
fn test_deletes_merge_blocks() {
    let store = small_block_store(CodecKind::None);
    // Four 125-byte records fill a block; their tombstones are 25 bytes each
    let payload = [b'p'; 100];
    for i in 1..=2_000 {
        assert!(store.put(&key(i), &payload).unwrap());
    }
    let peak = store.stats().block_count;

    for i in 1..=1_990 {
        assert!(store.delete(&key(i)).unwrap());
    }

    let stats = store.stats();
    assert!(stats.block_count < peak / 2, "{} of {} blocks left", stats.block_count, peak);
    assert_eq!(store.count_records().unwrap(), 10);
}

#[test]
fn test_tombstone_only_blocks_merge() {
    let config = StoreConfig::builder().block_size(256).build();
    let store = Store::new(config).unwrap();
    let name = |i: u32| format!("K{:06}", i).into_bytes();

    let mut order: Vec<u32> = (0..4_000).collect();
    order.shuffle(&mut StdRng::seed_from_u64(11));
    for &i in &order {
        assert!(store.put(&name(i), b"val").unwrap());
    }
    let before = store.stats().block_count;

    // Each block in the range ends up holding nothing but tombstones
    for i in 1_000..3_000 {
        assert!(store.delete(&name(i)).unwrap());
    }

    let stats = store.stats();
    assert!(
        stats.block_count < before * 6 / 10,
        "{} of {} blocks left",
        stats.block_count,
        before
    );
    assert!(stats.record_count < 2_100, "{} records kept", stats.record_count);
    assert_eq!(store.count_records().unwrap(), 2_000);
    assert!(store.exists(&name(999)).unwrap());
    assert!(!store.exists(&name(1_000)).unwrap());
    assert!(store.exists(&name(3_000)).unwrap());
}

// =============================================================================
// Memory Limit Tests
// =============================================================================

#[test]
fn test_memory_limit_refuses_puts() {
    const LIMIT: u64 = 256 * 1024;
    let config = StoreConfig::builder().memory_limit(LIMIT).build();
    let store = Store::new(config).unwrap();
    let payload = [b'p'; 100];

    let mut accepted = 0u64;
    while store.put(&key(accepted + 1), &payload).unwrap() {
        accepted += 1;
        assert!(store.memory_in_use() <= LIMIT);
        assert!(accepted < 1_000_000, "limit never enforced");
    }
    let refused = key(accepted + 1);

    assert!(accepted > 100);
    assert!(store.stats().allocated_memory <= LIMIT);
    assert_eq!(store.get(&refused).unwrap(), None);
    for i in 1..=accepted {
        assert_eq!(store.get(&key(i)).unwrap(), Some(payload.to_vec()));
    }

    // Deletes are never refused and give memory back
    for i in 1..=accepted / 2 {
        assert!(store.delete(&key(i)).unwrap());
    }
    assert!(store.put(&refused, &payload).unwrap());
    assert!(store.memory_in_use() <= LIMIT);
}

#[test]
fn test_memory_limit_covers_index_growth() {
    // Keys far larger than an index node make every leaf split cascade to
    // the root
    const LIMIT: u64 = 200_000;
    let config = StoreConfig::builder()
        .block_size(256)
        .index_node_size(256)
        .memory_limit(LIMIT)
        .build();
    let store = Store::new(config).unwrap();
    let padding = vec![b'k'; 3_000];
    let long_key = |i: u64| {
        let mut k = format!("{:06}", i).into_bytes();
        k.extend_from_slice(&padding);
        k
    };

    let mut accepted = 0u64;
    while store.put(&long_key(accepted), b"v").unwrap() {
        accepted += 1;
        assert!(
            store.memory_in_use() <= LIMIT,
            "{} bytes in use after {} puts",
            store.memory_in_use(),
            accepted
        );
        assert!(accepted < 10_000, "limit never enforced");
    }

    assert!(accepted > 10);
    assert!(store.stats().depth > 2);
    for i in 0..accepted {
        assert!(store.exists(&long_key(i)).unwrap());
    }
    assert!(!store.exists(&long_key(accepted)).unwrap());
}

#[test]
fn test_memory_limit_holds_under_concurrent_puts() {
    const LIMIT: u64 = 512 * 1024;
    let config = StoreConfig::builder()
        .block_size(512)
        .index_node_size(512)
        .memory_limit(LIMIT)
        .build();
    let store = Arc::new(Store::new(config).unwrap());

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                // Mix inline and external values across writers
                let payload = vec![b'x'; 40 + 50 * t as usize];
                let mut accepted = 0u64;
                loop {
                    let k = format!("T{}-{:08}", t, accepted).into_bytes();
                    if !store.put(&k, &payload).unwrap() {
                        break;
                    }
                    accepted += 1;
                    assert!(store.memory_in_use() <= LIMIT);
                }
                accepted
            })
        })
        .collect();
    let accepted: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(accepted.iter().all(|&n| n > 0), "{:?}", accepted);
    assert!(store.memory_in_use() <= LIMIT);
    assert_eq!(store.count_records().unwrap(), accepted.iter().sum::<u64>());
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = StoreConfig::default();
    config.memory_limit = 0;
    assert!(Store::new(config).is_err());

    let mut config = StoreConfig::default();
    config.block_size = 16;
    assert!(Store::new(config).is_err());
}

// =============================================================================
// Version Tests
// =============================================================================

#[test]
fn test_pinned_version_sees_old_value() {
    let store = default_store();
    store.put(b"k", b"v1").unwrap();

    let pin = store.pin_version();
    store.put(b"k", b"v2").unwrap();
    store.delete(b"other").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(store.get_at(b"k", &mut buf, pin.version()).unwrap(), Some(2));
    assert_eq!(&buf[..2], b"v1");
    assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(store.stats().record_count, 2);

    drop(pin);
    store.put(b"k", b"v3").unwrap();
    assert_eq!(store.stats().record_count, 1);
}

#[test]
fn test_deleted_key_visible_to_older_pin() {
    let store = default_store();
    store.put(b"k", b"alive").unwrap();
    let pin = store.pin_version();
    store.delete(b"k").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(store.get_at(b"k", &mut buf, pin.version()).unwrap(), Some(5));
    assert_eq!(store.get(b"k").unwrap(), None);
}

#[test]
fn test_delete_lands_when_pinned_versions_fill_block() {
    let config = StoreConfig::builder().block_size(256).build();
    let store = Store::new(config).unwrap();
    // 18-byte header + 1-byte key + 45-byte value: four versions fill a block
    let version_value = |i: u8| vec![b'a' + i; 45];

    let mut pins = Vec::new();
    let mut accepted = 0u8;
    while store.put(b"k", &version_value(accepted)).unwrap() {
        pins.push(store.pin_version());
        accepted += 1;
        assert!(accepted < 10, "block never filled");
    }
    assert_eq!(accepted, 4);

    assert!(store.delete(b"k").unwrap());
    assert!(!store.exists(b"k").unwrap());
    assert_eq!(store.get(b"k").unwrap(), None);

    // The oldest and newest pinned readers keep their views
    let mut buf = [0u8; 64];
    assert_eq!(store.get_at(b"k", &mut buf, pins[0].version()).unwrap(), Some(45));
    assert_eq!(&buf[..45], version_value(0).as_slice());
    assert_eq!(store.get_at(b"k", &mut buf, pins[3].version()).unwrap(), Some(45));
    assert_eq!(&buf[..45], version_value(3).as_slice());
}

#[test]
fn test_max_version_rejected() {
    let store = default_store();
    assert!(matches!(
        store.put_with_version(b"k", b"v", u64::MAX),
        Err(AtlasError::InvalidVersion(_))
    ));
    assert_eq!(store.get(b"k").unwrap(), None);
    assert_eq!(store.current_version(), 0);
}

#[test]
fn test_exhausted_versions_do_not_wrap() {
    let store = default_store();
    assert!(store.put_with_version(b"k", b"last", u64::MAX - 1).unwrap());

    assert!(matches!(store.put(b"k", b"next"), Err(AtlasError::VersionExhausted)));
    assert!(matches!(store.delete(b"k"), Err(AtlasError::VersionExhausted)));
    assert_eq!(store.get(b"k").unwrap(), Some(b"last".to_vec()));
    assert_eq!(store.current_version(), u64::MAX - 1);
}

#[test]
fn test_put_with_version_advances_clock() {
    let store = default_store();
    assert!(store.put_with_version(b"k", b"imported", 500).unwrap());
    assert_eq!(store.current_version(), 500);

    store.put(b"k", b"newer").unwrap();
    assert_eq!(store.current_version(), 501);
    assert_eq!(store.get(b"k").unwrap(), Some(b"newer".to_vec()));
}

// =============================================================================
// Statistics / Lifecycle Tests
// =============================================================================

#[test]
fn test_stats_track_contents() {
    let store = small_block_store(CodecKind::None);
    let empty = store.stats();
    assert_eq!(empty.block_count, 1);
    assert_eq!(empty.record_count, 0);
    assert_eq!(empty.depth, 1);

    load(&store, 1..=500);
    let stats = store.stats();
    assert_eq!(stats.record_count, 500);
    assert!(stats.block_count > 1);
    assert!(stats.index_size > 0);
    assert_eq!(stats.compressed_blocks, 0);
    assert_eq!(stats.data_size, stats.compressed_size);
    assert!(stats.allocated_memory >= stats.data_size);

    // Recomputing from the tree matches the live counters
    store.sync_statistics().unwrap();
    assert_eq!(store.stats(), stats);
}

#[test]
fn test_flush_all_empties_store() {
    let store = small_block_store(CodecKind::Lz4);
    load(&store, 1..=1_000);

    store.flush_all().unwrap();

    assert_eq!(store.count_records().unwrap(), 0);
    assert_eq!(store.get(&key(1)).unwrap(), None);
    let stats = store.stats();
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.data_size, 0);

    load(&store, 1..=10);
    assert_eq!(store.count_records().unwrap(), 10);
}

#[test]
fn test_dispose_after_load() {
    let store = small_block_store(CodecKind::Zstd);
    load(&store, 1..=1_000);
    store.put(b"huge", &vec![1u8; 50_000]).unwrap();

    store.dispose().unwrap();
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers_disjoint_keys() {
    let store = Arc::new(small_block_store(CodecKind::None));
    let mut workers = Vec::new();

    for t in 0..4u64 {
        let store = Arc::clone(&store);
        workers.push(thread::spawn(move || {
            for i in 0..1_000u64 {
                let n = t * 1_000_000 + i;
                assert!(store.put(&key(n), &value(n)).unwrap());
                if i % 4 == 0 {
                    assert!(store.delete(&key(n)).unwrap());
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    for t in 0..4u64 {
        for i in 0..1_000u64 {
            let n = t * 1_000_000 + i;
            let expected = if i % 4 == 0 { None } else { Some(value(n)) };
            assert_eq!(store.get(&key(n)).unwrap(), expected);
        }
    }
    assert_eq!(store.count_records().unwrap(), 3_000);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let store = Arc::new(small_block_store(CodecKind::Lz4));
    load(&store, 1..=2_000);
    let mut workers = Vec::new();

    for t in 0..2u64 {
        let store = Arc::clone(&store);
        workers.push(thread::spawn(move || {
            for i in 1..=2_000u64 {
                if i % 2 == t {
                    store.put(&key(i), format!("UPDATED{}", i).as_bytes()).unwrap();
                }
            }
        }));
    }
    for _ in 0..2 {
        let store = Arc::clone(&store);
        workers.push(thread::spawn(move || {
            for i in 1..=2_000u64 {
                let got = store.get(&key(i)).unwrap().expect("key vanished");
                assert!(got == value(i) || got == format!("UPDATED{}", i).into_bytes());
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    for i in 1..=2_000u64 {
        assert_eq!(store.get(&key(i)).unwrap(), Some(format!("UPDATED{}", i).into_bytes()));
    }
}
