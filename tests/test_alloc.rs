// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Allocation-path tests: lazy region initialisation, tier selection,
// chunk accounting on break, boundary shapes and tail-slack stamping.

use std::net::Ipv4Addr;

use flatcache::layout::*;
use flatcache::FlatStorage;

fn engine(maxbytes: usize) -> FlatStorage {
    FlatStorage::new(maxbytes).expect("region reservation")
}

fn set(fs: &mut FlatStorage, key: &[u8], value: &[u8]) -> ItemHandle {
    let it = fs
        .alloc(key, 0, 0, value.len(), Ipv4Addr::UNSPECIFIED)
        .expect("allocation");
    fs.memcpy_to(it, key.len(), value, false);
    fs.link(it, key);
    fs.deref(it);
    it
}

#[test]
fn lazy_init_brings_one_increment_online() {
    let fs = engine(2 * INCREMENT_DELTA);
    assert_eq!(fs.unused_memory(), INCREMENT_DELTA);
    assert_eq!(
        fs.large_free_list_sz(),
        INCREMENT_DELTA / LARGE_CHUNK_SZ
    );
    assert_eq!(fs.small_free_list_sz(), 0);
    fs.check_consistency();
}

#[test]
fn grow_stops_at_region_end() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    assert!(fs.grow());
    assert_eq!(fs.unused_memory(), 0);
    assert!(!fs.grow());
    assert_eq!(
        fs.large_free_list_sz(),
        2 * INCREMENT_DELTA / LARGE_CHUNK_SZ
    );
    fs.check_consistency();
}

#[test]
#[should_panic]
fn misaligned_region_is_fatal() {
    let _ = FlatStorage::new(INCREMENT_DELTA + LARGE_CHUNK_SZ);
}

#[test]
fn small_demand_breaks_one_large_chunk() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let before = fs.large_free_list_sz();

    let it = fs
        .alloc(b"k", 0, 0, 10, Ipv4Addr::UNSPECIFIED)
        .expect("small allocation");
    assert!(it.is_small());
    assert_eq!(fs.large_free_list_sz(), before - 1);
    assert_eq!(
        fs.small_free_list_sz(),
        SMALL_CHUNKS_PER_LARGE_CHUNK - 1
    );
    assert_eq!(fs.stats().break_events, 1);
    fs.check_consistency();
    fs.deref(it);
}

#[test]
fn minimal_and_maximal_shapes() {
    let mut fs = engine(2 * 1024 * 1024);

    // Smallest accepted item.
    let tiny = set(&mut fs, b"t", b"");
    assert_eq!(fs.item_chunk_count(tiny), 1);

    // Largest accepted item.
    let key = vec![b'K'; KEY_MAX_LENGTH];
    let value = vec![b'V'; MAX_ITEM_SIZE];
    let big = set(&mut fs, &key, &value);
    assert!(big.is_large());
    assert_eq!(
        fs.item_chunk_count(big),
        chunks_needed(KEY_MAX_LENGTH, MAX_ITEM_SIZE, Tier::Large)
    );
    let mut back = vec![0u8; MAX_ITEM_SIZE];
    fs.memcpy_from(&mut back, big, KEY_MAX_LENGTH, false);
    assert_eq!(back, value);

    // One byte past either limit is rejected outright.
    let long_key = vec![b'K'; KEY_MAX_LENGTH + 1];
    assert!(fs
        .alloc(&long_key, 0, 0, 1, Ipv4Addr::UNSPECIFIED)
        .is_none());
    assert!(fs
        .alloc(b"k", 0, 0, MAX_ITEM_SIZE + 1, Ipv4Addr::UNSPECIFIED)
        .is_none());
    assert!(!fs.size_ok(KEY_MAX_LENGTH + 1, 0, 1));
    assert!(!fs.size_ok(1, 0, MAX_ITEM_SIZE + 1));
    assert!(fs.size_ok(KEY_MAX_LENGTH, 0, MAX_ITEM_SIZE));

    fs.check_consistency();
}

#[test]
fn tier_boundary_is_exact() {
    let mut fs = engine(64 * INCREMENT_DELTA);

    let at_limit = set(&mut fs, b"a", &vec![b'x'; SMALL_ITEM_MAX_PAYLOAD - 1]);
    assert!(at_limit.is_small());
    assert_eq!(
        fs.item_chunk_count(at_limit),
        SMALL_CHUNKS_PER_LARGE_CHUNK
    );

    let past_limit = set(&mut fs, b"b", &vec![b'x'; SMALL_ITEM_MAX_PAYLOAD]);
    assert!(past_limit.is_large());
    assert_eq!(fs.item_chunk_count(past_limit), 1);

    fs.check_consistency();
}

#[test]
fn key_spills_across_small_chunks() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let key = vec![b'K'; KEY_MAX_LENGTH];
    let value = vec![b'v'; 100];
    let it = set(&mut fs, &key, &value);
    assert!(it.is_small());

    assert!(fs.key_compare(it, &key));
    let mut scratch = [0u8; KEY_MAX_LENGTH];
    assert_eq!(fs.key_copy(it, &mut scratch), &key[..]);

    let mut back = vec![0u8; 100];
    fs.memcpy_from(&mut back, it, key.len(), false);
    assert_eq!(back, value);
    fs.check_consistency();
}

#[test]
fn key_compare_rejects_other_keys() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let it = set(&mut fs, b"alpha", b"value");
    assert!(fs.key_compare(it, b"alpha"));
    assert!(!fs.key_compare(it, b"beta1"));
    assert!(!fs.key_compare(it, b"alph"));
}

#[test]
fn stamp_needs_slack() {
    let mut fs = engine(2 * INCREMENT_DELTA);

    // Single small chunk: payload 84 of 92 leaves room for both stamps.
    let both = set(&mut fs, b"k", &vec![b'x'; SMALL_TITLE_DATA_SZ - 1 - 8]);
    let f = fs.item_it_flags(both);
    assert!(f & ITEM_HAS_TIMESTAMP != 0);
    assert!(f & ITEM_HAS_IP_ADDRESS != 0);

    // Payload 88 of 92: timestamp only.
    let ts_only = set(&mut fs, b"l", &vec![b'x'; SMALL_TITLE_DATA_SZ - 1 - 4]);
    let f = fs.item_it_flags(ts_only);
    assert!(f & ITEM_HAS_TIMESTAMP != 0);
    assert!(f & ITEM_HAS_IP_ADDRESS == 0);

    // Payload fills the chunk: neither stamp.
    let none = set(&mut fs, b"m", &vec![b'x'; SMALL_TITLE_DATA_SZ - 1]);
    let f = fs.item_it_flags(none);
    assert!(f & ITEM_HAS_TIMESTAMP == 0);
    assert!(f & ITEM_HAS_IP_ADDRESS == 0);

    fs.check_consistency();
}

#[test]
fn stamp_lands_in_last_chunk_of_a_chain() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let cap = SMALL_TITLE_DATA_SZ + SMALL_BODY_DATA_SZ;

    let it = fs
        .alloc(b"kk", 0, 0, cap - 2 - 8, Ipv4Addr::new(10, 1, 2, 3))
        .expect("allocation");
    assert_eq!(fs.item_chunk_count(it), 2);
    let f = fs.item_it_flags(it);
    assert!(f & ITEM_HAS_TIMESTAMP != 0);
    assert!(f & ITEM_HAS_IP_ADDRESS != 0);

    // The stamps sit in tail slack, readable only beyond the boundary.
    let payload = 2 + (cap - 2 - 8);
    let mut stamps = [0u8; 8];
    fs.memcpy_from(&mut stamps, it, payload, true);
    assert_eq!(&stamps[4..], &[10, 1, 2, 3]);
    fs.deref(it);
    fs.check_consistency();
}

#[test]
fn need_realloc_tracks_shape_changes() {
    let mut fs = engine(64 * INCREMENT_DELTA);
    let it = set(&mut fs, b"key", &vec![b'x'; 40]);

    // Same chunk count: no realloc.
    assert!(!fs.need_realloc(it, 3, 0, 50));
    // Crossing into a second small chunk: realloc.
    assert!(fs.need_realloc(it, 3, 0, SMALL_TITLE_DATA_SZ + 1));
    // Crossing tiers: realloc.
    assert!(fs.need_realloc(it, 3, 0, SMALL_ITEM_MAX_PAYLOAD + 1));

    let big = set(&mut fs, b"big", &vec![b'x'; 2 * LARGE_CHUNK_SZ]);
    assert!(big.is_large());
    assert!(!fs.need_realloc(big, 3, 0, 2 * LARGE_CHUNK_SZ + 10));
    assert!(fs.need_realloc(big, 3, 0, 10));
}

#[test]
fn alloc_failure_leaves_no_trace() {
    let mut fs = engine(INCREMENT_DELTA);

    // Pin everything so eviction has no victim.
    let mut held = Vec::new();
    for i in 0..INCREMENT_DELTA / LARGE_CHUNK_SZ {
        let key = format!("pin:{i}");
        set(&mut fs, key.as_bytes(), &vec![b'x'; LARGE_TITLE_DATA_SZ - 6]);
        held.push(fs.get(key.as_bytes()).expect("just stored"));
    }
    assert_eq!(fs.large_free_list_sz(), 0);

    let before = *fs.stats();
    assert!(fs
        .alloc(b"nope", 0, 0, LARGE_CHUNK_SZ, Ipv4Addr::UNSPECIFIED)
        .is_none());
    assert_eq!(fs.stats().curr_items, before.curr_items);
    fs.check_consistency();

    for it in held {
        fs.deref(it);
    }
}
