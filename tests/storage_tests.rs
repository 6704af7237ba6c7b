// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Storage-engine integration tests: allocation/deallocation balance,
//! the small/large boundary, eviction under pinning, coalescing, flush
//! semantics, deferred deletes, and arithmetic.

use flatcached::storage::chunk::{
    ChunkKind, SMALL_BODY_DATA_SIZE, SMALL_CHUNKS_PER_LARGE_CHUNK, SMALL_TITLE_DATA_SIZE,
};
use flatcached::storage::items::ItemGet;
use flatcached::storage::{FlatStorage, StorageConfig, StoreMode};
use flatcached::CacheError;

const LARGE: usize = 1024;

fn make_storage(chunks: usize) -> FlatStorage {
    let mut config = StorageConfig::new(LARGE * chunks);
    config.grow_delta = LARGE * chunks;
    config.hash_power = 8;
    FlatStorage::new(config).unwrap()
}

/// Allocate, fill, and link an item the way the protocol engine would.
fn put(storage: &mut FlatStorage, key: &[u8], value: &[u8], exptime: u32, now: u32) -> bool {
    let it = storage
        .item_alloc(key, 0, exptime, value.len() + 2, None, now)
        .unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, value);
    let stored = storage.store_item(it, StoreMode::Set, now);
    storage.do_item_deref(it);
    stored
}

fn get_value(storage: &mut FlatStorage, key: &[u8], now: u32) -> Option<Vec<u8>> {
    match storage.item_get(key, now) {
        ItemGet::Hit(it) => {
            let value = storage.value_copy(it);
            storage.do_item_deref(it);
            Some(value)
        }
        _ => None,
    }
}

#[test]
fn test_set_get_round_trip() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"key", b"value", 0, 1));
    assert_eq!(get_value(&mut storage, b"key", 1).as_deref(), Some(&b"value"[..]));
    // get is idempotent
    assert_eq!(get_value(&mut storage, b"key", 1).as_deref(), Some(&b"value"[..]));
}

#[test]
fn test_set_preserves_flags_and_exptime() {
    let mut storage = make_storage(64);
    let it = storage.item_alloc(b"k", 77, 500, 3 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"abc");
    storage.store_item(it, StoreMode::Set, 1);
    storage.do_item_deref(it);

    match storage.item_get(b"k", 2) {
        ItemGet::Hit(it) => {
            let header = *storage.table().title(it);
            assert_eq!(header.flags, 77);
            assert_eq!(header.exptime, 500);
            storage.do_item_deref(it);
        }
        other => panic!("expected hit, got {other:?}"),
    }
}

#[test]
fn test_add_and_replace_predicates() {
    let mut storage = make_storage(64);

    // add succeeds iff absent
    let it = storage.item_alloc(b"a", 0, 0, 3 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"one");
    assert!(storage.store_item(it, StoreMode::Add, 1));
    storage.do_item_deref(it);

    let it = storage.item_alloc(b"a", 0, 0, 3 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"two");
    assert!(!storage.store_item(it, StoreMode::Add, 1));
    storage.do_item_deref(it);
    assert_eq!(get_value(&mut storage, b"a", 1).as_deref(), Some(&b"one"[..]));

    // replace succeeds iff present
    let it = storage.item_alloc(b"missing", 0, 0, 1 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"x");
    assert!(!storage.store_item(it, StoreMode::Replace, 1));
    storage.do_item_deref(it);

    let it = storage.item_alloc(b"a", 0, 0, 3 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"two");
    assert!(storage.store_item(it, StoreMode::Replace, 1));
    storage.do_item_deref(it);
    assert_eq!(get_value(&mut storage, b"a", 1).as_deref(), Some(&b"two"[..]));
}

#[test]
fn test_append_concatenates() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"log", b"hello", 0, 1));

    let it = storage.item_alloc(b"log", 0, 0, 6 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b" world");
    assert!(storage.store_item(it, StoreMode::Append, 1));
    storage.do_item_deref(it);

    assert_eq!(
        get_value(&mut storage, b"log", 1).as_deref(),
        Some(&b"hello world"[..])
    );

    // append to a missing key is not stored
    let it = storage.item_alloc(b"nope", 0, 0, 1 + 2, None, 1).unwrap();
    storage.prepare_value_receive(it);
    storage.write_value(it, 0, b"x");
    assert!(!storage.store_item(it, StoreMode::Append, 1));
    storage.do_item_deref(it);
}

#[test]
fn test_delete_then_get_misses() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"gone", b"v", 0, 1));

    match storage.item_get(b"gone", 1) {
        ItemGet::Hit(it) => {
            storage.do_item_unlink(it, flatcached::storage::UnlinkReason::Normal, 1);
            storage.do_item_deref(it);
        }
        other => panic!("expected hit, got {other:?}"),
    }
    assert!(get_value(&mut storage, b"gone", 1).is_none());
}

#[test]
fn test_small_large_boundary_uses_right_flavor() {
    let mut storage = make_storage(64);
    let threshold =
        SMALL_TITLE_DATA_SIZE + SMALL_BODY_DATA_SIZE * (SMALL_CHUNKS_PER_LARGE_CHUNK - 2);

    // nkey + nbytes exactly at the threshold: small chunks
    let nkey = 4;
    let it = storage
        .item_alloc(b"smol", 0, 0, threshold - nkey, None, 1)
        .unwrap();
    assert!(storage.table().is_small_item(it));
    storage.do_item_deref(it);

    // one byte more: large chunks
    let it = storage
        .item_alloc(b"big!", 0, 0, threshold - nkey + 1, None, 1)
        .unwrap();
    assert!(!storage.table().is_small_item(it));
    storage.do_item_deref(it);
}

#[test]
fn test_alloc_dealloc_returns_chunks() {
    let mut storage = make_storage(64);
    let large_before = storage.large_free_count();
    let small_before = storage.small_free_count();

    // a small item (breaks one large chunk) and a multi-chunk large item
    assert!(put(&mut storage, b"s", b"tiny", 0, 1));
    assert!(put(&mut storage, b"l", &vec![7u8; 3000], 0, 1));

    for key in [b"s".as_slice(), b"l".as_slice()] {
        match storage.item_get(key, 1) {
            ItemGet::Hit(it) => {
                storage.do_item_unlink(it, flatcached::storage::UnlinkReason::Normal, 1);
                storage.do_item_deref(it);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    // freeing the small item re-merges its parent, so both lists return
    // to their starting sizes
    assert_eq!(storage.large_free_count(), large_before);
    assert_eq!(storage.small_free_count(), small_before);
    assert_eq!(storage.curr_items(), 0);
}

#[test]
fn test_size_limits_rejected() {
    let mut storage = make_storage(64);
    let long_key = vec![b'k'; 256];
    assert!(matches!(
        storage.item_alloc(&long_key, 0, 0, 10, None, 1),
        Err(CacheError::SizeInvalid { .. })
    ));
    assert!(matches!(
        storage.item_alloc(b"k", 0, 0, 1024 * 1024 + 1, None, 1),
        Err(CacheError::SizeInvalid { .. })
    ));
}

#[test]
fn test_arena_exhaustion_with_pinned_items_fails_clean() {
    let mut storage = make_storage(16);

    // fill the arena with single-chunk large items and keep every ref
    let value = vec![0u8; 900];
    let mut held = Vec::new();
    let mut index = 0;
    loop {
        let key = format!("pin-{index}");
        let it = match storage.item_alloc(key.as_bytes(), 0, 0, value.len() + 2, None, 1) {
            Ok(it) => it,
            Err(CacheError::OutOfMemory { .. }) => break,
            Err(other) => panic!("unexpected error: {other}"),
        };
        storage.prepare_value_receive(it);
        storage.write_value(it, 0, &value);
        storage.store_item(it, StoreMode::Set, 1);
        held.push(it);
        index += 1;
    }
    assert!(!held.is_empty());

    // nothing evictable: pinned items must survive
    assert_eq!(storage.curr_items(), held.len() as u64);

    // releasing one reference makes exactly that space reusable
    let it = held.pop().unwrap();
    storage.do_item_deref(it);
    let retry = storage
        .item_alloc(b"retry", 0, 0, value.len() + 2, None, 2)
        .unwrap();
    storage.do_item_deref(retry);

    for it in held {
        storage.do_item_deref(it);
    }
}

#[test]
fn test_eviction_reclaims_lru_tail() {
    let mut storage = make_storage(16);

    // fill with unpinned items, then keep inserting: old tails get evicted
    for index in 0..64 {
        let key = format!("k-{index}");
        assert!(put(&mut storage, key.as_bytes(), &vec![1u8; 900], 0, index + 1));
    }

    assert!(storage.stats.evictions > 0);
    // the most recent insert must still be resident
    assert!(get_value(&mut storage, b"k-63", 65).is_some());
}

#[test]
fn test_coalescing_forms_large_chunk_and_index_survives() {
    let mut storage = make_storage(16);

    // fill the arena with small items so every large chunk is broken
    let mut keys = Vec::new();
    let mut index = 0;
    loop {
        let key = format!("small-{index}");
        if !put(&mut storage, key.as_bytes(), b"0123456789", 0, 1) {
            break;
        }
        keys.push(key);
        index += 1;
        if storage.large_free_count() == 0 && index > 100 {
            break;
        }
    }
    assert!(storage.stats.break_events > 0);

    // a multi-chunk large item now needs coalescing or eviction
    assert!(put(&mut storage, b"biggie", &vec![9u8; 3000], 0, 2));
    assert_eq!(
        get_value(&mut storage, b"biggie", 2).as_deref(),
        Some(&vec![9u8; 3000][..])
    );

    // every surviving small item still resolves through the index
    let mut survivors = 0;
    for key in &keys {
        if let Some(value) = get_value(&mut storage, key.as_bytes(), 2) {
            assert_eq!(value, b"0123456789");
            survivors += 1;
        }
    }
    assert!(survivors > 0);
}

#[test]
fn test_flush_all_expires_everything() {
    let mut storage = make_storage(64);
    let large_before = storage.large_free_count();

    for index in 0..32 {
        let key = format!("f-{index}");
        assert!(put(&mut storage, key.as_bytes(), &vec![2u8; 1500], 300, 10));
    }

    storage.set_oldest_live(10);
    storage.flush_expired(11);

    for index in 0..32 {
        let key = format!("f-{index}");
        assert!(get_value(&mut storage, key.as_bytes(), 11).is_none());
    }
    assert_eq!(storage.curr_items(), 0);
    assert_eq!(storage.large_free_count(), large_before);
}

#[test]
fn test_lazy_expiration_on_get() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"ttl", b"v", 5, 1));

    assert!(get_value(&mut storage, b"ttl", 4).is_some());
    assert!(get_value(&mut storage, b"ttl", 5).is_none());
    assert!(storage.stats.expirations > 0);
}

#[test]
fn test_deferred_delete_locks_then_reaps() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"later", b"v", 0, 1));

    match storage.item_get(b"later", 1) {
        ItemGet::Hit(it) => storage.defer_delete(it, 6),
        other => panic!("expected hit, got {other:?}"),
    }

    // inside the window: delete-locked
    assert!(matches!(
        storage.item_get(b"later", 3),
        ItemGet::DeleteLocked
    ));

    // the timer reaps it once the window elapses
    storage.run_deferred_deletes(6);
    assert!(matches!(storage.item_get(b"later", 7), ItemGet::Miss));
    assert_eq!(storage.curr_items(), 0);
}

#[test]
fn test_incr_decr_semantics() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"n", b"41", 0, 1));

    let it = match storage.item_get(b"n", 1) {
        ItemGet::Hit(it) => it,
        other => panic!("expected hit, got {other:?}"),
    };

    assert_eq!(storage.add_delta(it, true, 1, 1).unwrap(), 42);
    // decr saturates at zero
    assert_eq!(storage.add_delta(it, false, 100, 1).unwrap(), 0);
    storage.do_item_deref(it);

    // growing past the old width reallocates and relinks
    assert!(put(&mut storage, b"g", b"9", 0, 1));
    let it = match storage.item_get(b"g", 1) {
        ItemGet::Hit(it) => it,
        other => panic!("expected hit, got {other:?}"),
    };
    assert_eq!(storage.add_delta(it, true, 991, 1).unwrap(), 1000);
    storage.do_item_deref(it);
    assert_eq!(get_value(&mut storage, b"g", 1).as_deref(), Some(&b"1000"[..]));

    // repeated incr tolerates space padding from in-place rewrites
    let it = match storage.item_get(b"n", 1) {
        ItemGet::Hit(it) => it,
        other => panic!("expected hit, got {other:?}"),
    };
    assert_eq!(storage.add_delta(it, true, 5, 1).unwrap(), 5);
    storage.do_item_deref(it);

    // non-numeric values report a parse failure
    assert!(put(&mut storage, b"s", b"abc", 0, 1));
    let it = match storage.item_get(b"s", 1) {
        ItemGet::Hit(it) => it,
        other => panic!("expected hit, got {other:?}"),
    };
    assert!(matches!(
        storage.add_delta(it, true, 1, 1),
        Err(CacheError::NumericParse { .. })
    ));
    storage.do_item_deref(it);

    // a decimal value too wide for 32 bits is a range failure, not a
    // parse failure
    assert!(put(&mut storage, b"wide", b"4294967296", 0, 1));
    let it = match storage.item_get(b"wide", 1) {
        ItemGet::Hit(it) => it,
        other => panic!("expected hit, got {other:?}"),
    };
    assert!(matches!(
        storage.add_delta(it, true, 1, 1),
        Err(CacheError::NumericRange { .. })
    ));
    storage.do_item_deref(it);
}

#[test]
fn test_expire_regex_unlinks_matches() {
    let mut storage = make_storage(64);
    for index in 0..10 {
        assert!(put(&mut storage, format!("sess:{index}").as_bytes(), b"v", 0, 1));
    }
    assert!(put(&mut storage, b"keep", b"v", 0, 1));

    let re = regex::Regex::new("^sess:").unwrap();
    assert_eq!(storage.expire_regex(&re, 2), 10);

    assert!(get_value(&mut storage, b"sess:0", 2).is_none());
    assert!(get_value(&mut storage, b"keep", 2).is_some());
}

#[test]
fn test_lru_times_are_ordered() {
    let mut storage = make_storage(64);
    for index in 0..20u32 {
        let key = format!("t-{index}");
        assert!(put(&mut storage, key.as_bytes(), b"xx", 0, index + 1));
    }

    // walking from the head, times never increase
    for kind in [ChunkKind::Small, ChunkKind::Large] {
        let mut cursor = storage.lru_head(kind);
        let mut last = u32::MAX;
        while let Some(it) = cursor {
            let header = *storage.table().title(it);
            assert!(header.time <= last);
            last = header.time;
            cursor = header.next;
        }
    }
}

#[test]
fn test_update_is_throttled() {
    let mut storage = make_storage(64);
    assert!(put(&mut storage, b"hot", b"v", 0, 100));
    assert!(put(&mut storage, b"newer", b"v", 0, 101));

    // within the update interval the item stays put
    match storage.item_get(b"hot", 120) {
        ItemGet::Hit(it) => {
            storage.do_item_update(it, 120);
            let header = *storage.table().title(it);
            assert_eq!(header.time, 100);
            storage.do_item_deref(it);
        }
        other => panic!("expected hit, got {other:?}"),
    }

    // past the interval it moves to the head with a fresh timestamp
    match storage.item_get(b"hot", 200) {
        ItemGet::Hit(it) => {
            storage.do_item_update(it, 200);
            let header = *storage.table().title(it);
            assert_eq!(header.time, 200);
            assert_eq!(storage.lru_head(ChunkKind::Small), Some(it));
            storage.do_item_deref(it);
        }
        other => panic!("expected hit, got {other:?}"),
    }
}
