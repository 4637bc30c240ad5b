// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Lifecycle and recency tests: LRU ordering, rate-limited touch, the
// delete lock, refcount pinning, global flush, eviction under pressure
// and the text dump surfaces.

use std::net::Ipv4Addr;

use flatcache::layout::*;
use flatcache::{FlatStorage, Tier, UnlinkCause};

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

fn get_value(fs: &mut FlatStorage, key: &[u8]) -> Option<Vec<u8>> {
    let it = fs.get(key)?;
    let mut value = vec![0u8; fs.item_nbytes(it)];
    fs.memcpy_from(&mut value, it, key.len(), false);
    fs.deref(it);
    Some(value)
}

#[test]
fn link_pushes_at_lru_head() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let a = set(&mut fs, b"a", b"1");
    assert_eq!(fs.lru_head(), Some(a));
    assert_eq!(fs.lru_tail(), Some(a));

    let b = set(&mut fs, b"b", b"2");
    assert_eq!(fs.lru_head(), Some(b));
    assert_eq!(fs.lru_tail(), Some(a));

    let c = set(&mut fs, b"c", b"3");
    assert_eq!(fs.lru_head(), Some(c));
    assert_eq!(fs.lru_tail(), Some(a));
    fs.check_consistency();
}

#[test]
fn update_is_rate_limited() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let a = set(&mut fs, b"a", b"1");
    let b = set(&mut fs, b"b", b"2");
    assert_eq!(fs.lru_head(), Some(b));

    // Inside the interval: no reordering.
    fs.set_clock(fs.current_time() + UPDATE_INTERVAL);
    fs.update(a);
    assert_eq!(fs.lru_head(), Some(b));

    // Stale enough: moves to the head and refreshes the touch time.
    fs.set_clock(fs.current_time() + 1);
    fs.update(a);
    assert_eq!(fs.lru_head(), Some(a));
    assert_eq!(fs.item_time(a), fs.current_time());
    fs.check_consistency();
}

#[test]
fn get_bumps_and_deref_releases() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    set(&mut fs, b"held", b"payload");

    let it = fs.get(b"held").expect("hit");
    assert_eq!(fs.item_refcount(it), 1);
    let again = fs.get(b"held").expect("hit");
    assert_eq!(again, it);
    assert_eq!(fs.item_refcount(it), 2);
    fs.deref(it);
    fs.deref(it);
    assert_eq!(fs.item_refcount(it), 0);
    assert_eq!(get_value(&mut fs, b"held").unwrap(), b"payload");
}

#[test]
fn held_item_survives_unlink_until_deref() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    set(&mut fs, b"k", b"v");

    let it = fs.get(b"k").expect("hit");
    let free_before = fs.small_free_list_sz();
    fs.unlink(it, UnlinkCause::Explicit, Some(b"k"));
    assert!(fs.get(b"k").is_none());

    // The chain is still intact for the holder.
    assert_eq!(fs.item_refcount(it), 1);
    let mut v = [0u8; 1];
    fs.memcpy_from(&mut v, it, 1, false);
    assert_eq!(&v, b"v");
    assert_eq!(fs.small_free_list_sz(), free_before);

    // Last deref reclaims the chunks.
    fs.deref(it);
    assert!(fs.small_free_list_sz() > free_before || fs.large_free_list_sz() > 0);
    fs.check_consistency();
}

#[test]
fn expired_item_is_reaped_on_get() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    fs.set_clock(100);
    let it = fs
        .alloc(b"ttl", 0, 150, 3, Ipv4Addr::UNSPECIFIED)
        .expect("allocation");
    fs.memcpy_to(it, 3, b"abc", false);
    fs.link(it, b"ttl");
    fs.deref(it);

    assert!(get_value(&mut fs, b"ttl").is_some());
    fs.set_clock(150);
    assert!(fs.get(b"ttl").is_none());
    assert_eq!(fs.stats().expirations, 1);
    assert_eq!(fs.stats().curr_items, 0);
    fs.check_consistency();
}

#[test]
fn delete_lock_window() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    fs.set_clock(100);
    set(&mut fs, b"d", b"x");

    let it = fs.get(b"d").expect("hit");
    fs.mark_deleted(it, 110);
    fs.deref(it);

    // While the lock runs, both get flavours miss; only one reports why.
    assert!(fs.get(b"d").is_none());
    let mut locked = false;
    assert!(fs.get_notedeleted(b"d", &mut locked).is_none());
    assert!(locked);

    // After the deadline the item is visible again.
    fs.set_clock(111);
    let mut locked = true;
    let it = fs.get_notedeleted(b"d", &mut locked).expect("lock expired");
    assert!(!locked);
    assert!(fs.item_it_flags(it) & ITEM_DELETED != 0);
    fs.clear_deleted(it);
    fs.deref(it);
    fs.check_consistency();
}

#[test]
fn replace_rebinds_key() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    set(&mut fs, b"r", b"old");

    let old = fs.get_nocheck(b"r").expect("hit");
    let new = fs
        .alloc(b"r", 0, 0, 3, Ipv4Addr::UNSPECIFIED)
        .expect("allocation");
    fs.memcpy_to(new, 1, b"new", false);
    fs.replace(old, new, b"r");
    fs.deref(old);
    fs.deref(new);

    assert_eq!(get_value(&mut fs, b"r").unwrap(), b"new");
    assert_eq!(fs.stats().curr_items, 1);
    fs.check_consistency();
}

#[test]
fn flush_point_reaps_items_touched_at_or_after_it() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    fs.set_clock(10);
    set(&mut fs, b"old", b"1");
    fs.set_clock(20);
    set(&mut fs, b"mid", b"2");
    fs.set_clock(30);
    set(&mut fs, b"new", b"3");

    fs.settings_mut().oldest_live = 20;

    // Lookups reap flushed items lazily, before any sweep runs.
    assert!(fs.get(b"new").is_none());
    assert_eq!(fs.stats().curr_items, 2);

    // The sweep walks from the head and stops at the first item that
    // predates the flush point.
    fs.flush_expired();
    assert_eq!(fs.stats().curr_items, 1);
    assert!(fs.get(b"mid").is_none());

    // The older item predates the flush and survives both paths.
    assert_eq!(get_value(&mut fs, b"old").unwrap(), b"1");
    fs.check_consistency();
}

#[test]
fn detail_prefix_stats_record_removals() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    fs.settings_mut().detail_enabled = true;
    set(&mut fs, b"user:1", b"aaaa");
    set(&mut fs, b"user:2", b"bb");
    set(&mut fs, b"session:9", b"c");
    set(&mut fs, b"plain", b"d");

    for key in [b"user:1".as_slice(), b"user:2", b"session:9", b"plain"] {
        let it = fs.get_nocheck(key).expect("resident key");
        fs.unlink(it, UnlinkCause::Explicit, Some(key));
        fs.deref(it);
    }

    let detail = fs.prefix_stats();
    let user = detail.get(b"user".as_slice()).expect("user prefix recorded");
    assert_eq!(user.items, 2);
    assert_eq!(user.bytes, (6 + 4) + (6 + 2));
    let session = detail
        .get(b"session".as_slice())
        .expect("session prefix recorded");
    assert_eq!(session.items, 1);
    assert_eq!(session.bytes, 9 + 1);
    // Keys without a delimiter are not attributed to any prefix.
    assert!(detail.get(b"plain".as_slice()).is_none());

    // Recording is gated on the setting.
    fs.settings_mut().detail_enabled = false;
    set(&mut fs, b"user:3", b"x");
    let it = fs.get_nocheck(b"user:3").expect("resident key");
    fs.unlink(it, UnlinkCause::Explicit, Some(b"user:3"));
    fs.deref(it);
    assert_eq!(fs.prefix_stats()[b"user".as_slice()].items, 2);
    fs.check_consistency();
}

#[test]
fn pressure_evicts_from_the_tail() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    let chunks = 2 * INCREMENT_DELTA / LARGE_CHUNK_SZ;
    let per_parent = SMALL_CHUNKS_PER_LARGE_CHUNK;

    // Fill the region with single-chunk small items.
    let total = chunks * per_parent;
    for i in 0..total {
        let key = format!("s:{i}");
        set(&mut fs, key.as_bytes(), &vec![b'x'; 40]);
    }
    assert_eq!(fs.large_free_list_sz(), 0);
    assert_eq!(fs.small_free_list_sz(), 0);
    assert_eq!(fs.unused_memory(), 0);

    // A large demand must evict cold items until whole chunks reappear.
    let needed = chunks_needed(3, 3 * LARGE_CHUNK_SZ, Tier::Large);
    let big = set(&mut fs, b"big", &vec![b'Y'; 3 * LARGE_CHUNK_SZ]);
    assert!(big.is_large());
    assert_eq!(fs.stats().evictions as usize, needed * per_parent);

    // The oldest keys are gone, the newest survive.
    for i in 0..needed * per_parent {
        let key = format!("s:{i}");
        assert!(fs.get(key.as_bytes()).is_none(), "expected {key} evicted");
    }
    for i in needed * per_parent..total {
        let key = format!("s:{i}");
        let it = fs
            .get(key.as_bytes())
            .unwrap_or_else(|| panic!("expected {key} resident"));
        fs.deref(it);
    }
    assert_eq!(get_value(&mut fs, b"big").unwrap(), vec![b'Y'; 3 * LARGE_CHUNK_SZ]);
    fs.check_consistency();
}

#[test]
fn cachedump_lists_tier_members_in_recency_order() {
    let mut fs = engine(64 * INCREMENT_DELTA);
    set(&mut fs, b"first", b"11");
    set(&mut fs, b"second", b"222");
    set(&mut fs, b"bulky", &vec![b'x'; 2 * LARGE_CHUNK_SZ]);

    let dump = fs.cachedump(Tier::Small, 0);
    let text = String::from_utf8(dump).expect("ascii keys");
    let abs = u64::from(fs.started()) + u64::from(fs.current_time());
    assert_eq!(
        text,
        format!("ITEM second [3 b; {abs} s]\r\nITEM first [2 b; {abs} s]\r\nEND\r\n")
    );

    let dump = fs.cachedump(Tier::Large, 0);
    let text = String::from_utf8(dump).expect("ascii keys");
    assert_eq!(text, format!("ITEM bulky [2048 b; {abs} s]\r\nEND\r\n"));

    // The limit caps the item count, not the terminator.
    let dump = fs.cachedump(Tier::Small, 1);
    let text = String::from_utf8(dump).expect("ascii keys");
    assert_eq!(text, format!("ITEM second [3 b; {abs} s]\r\nEND\r\n"));
}

#[test]
fn stats_sizes_counts_each_item_once() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    set(&mut fs, b"one", b"xx");
    set(&mut fs, b"two", b"yy");

    let text = String::from_utf8(fs.stats_sizes()).expect("ascii");
    // Both items share a bucket: header + 3 + 2 rounded up to 32.
    let ntotal = ITEM_HEADER_SZ + 5;
    let bucket = (ntotal + 31) / 32 * 32;
    assert_eq!(text, format!("{bucket} 2\r\nEND\r\n"));
}

#[test]
fn allocator_stats_text_shape() {
    let mut fs = engine(2 * INCREMENT_DELTA);
    set(&mut fs, b"k", b"v");

    let text = String::from_utf8(fs.allocator_stats()).expect("ascii");
    assert!(text.ends_with("END\r\n"));
    assert!(text.contains(&format!("STAT large_chunk_sz {LARGE_CHUNK_SZ}\r\n")));
    assert!(text.contains(&format!("STAT small_chunk_sz {SMALL_CHUNK_SZ}\r\n")));
    assert!(text.contains("STAT break_events 1\r\n"));
    assert!(text.contains(&format!(
        "STAT unused_memory {}\r\n",
        fs.unused_memory()
    )));
    // One USED child on the single broken parent.
    assert!(text.contains("STAT broken_chunk_histogram_1 1\r\n"));
}
