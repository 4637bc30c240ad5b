// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Usage:
//   demo_cache [region_bytes]
//
// Drives the engine end-to-end in one process: fills the region with
// small items, deletes a third to fragment it, then allocates large
// values until the coalescer has to reassemble whole chunks.  Prints the
// allocator stats before and after.

use std::net::Ipv4Addr;

use flatcache::layout::{INCREMENT_DELTA, LARGE_CHUNK_SZ};
use flatcache::{FlatStorage, UnlinkCause};

fn set(fs: &mut FlatStorage, key: &[u8], value: &[u8]) -> bool {
    let it = match fs.alloc(key, 0, 0, value.len(), Ipv4Addr::UNSPECIFIED) {
        Some(it) => it,
        None => return false,
    };
    fs.memcpy_to(it, key.len(), value, false);
    if let Some(old) = fs.get_nocheck(key) {
        fs.replace(old, it, key);
        fs.deref(old);
    } else {
        fs.link(it, key);
    }
    fs.deref(it);
    true
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let region_bytes = match args.get(1) {
        Some(a) => a.parse::<usize>().unwrap_or_else(|_| {
            eprintln!("usage: demo_cache [region_bytes]");
            std::process::exit(1);
        }),
        None => 64 * INCREMENT_DELTA,
    };

    let mut fs = FlatStorage::new(region_bytes).expect("region reservation");
    println!(
        "region: {} bytes ({} large chunks max)",
        region_bytes,
        region_bytes / LARGE_CHUNK_SZ
    );

    // Phase 1: small-item churn.
    let mut stored = 0usize;
    for i in 0..10_000 {
        let key = format!("small:{i}");
        let value = vec![b'v'; 40 + (i % 50)];
        if !set(&mut fs, key.as_bytes(), &value) {
            break;
        }
        stored += 1;
    }
    println!("stored {stored} small items");

    // Phase 2: fragment by deleting every third item.
    let mut deleted = 0usize;
    for i in (0..stored).step_by(3) {
        let key = format!("small:{i}");
        if let Some(it) = fs.get_nocheck(key.as_bytes()) {
            fs.unlink(it, UnlinkCause::Explicit, Some(key.as_bytes()));
            fs.deref(it);
            deleted += 1;
        }
    }
    println!("deleted {deleted} items");
    println!("-- stats before large demand --");
    print!("{}", String::from_utf8_lossy(&fs.allocator_stats()));

    // Phase 3: large values force coalescing.
    let mut large_stored = 0usize;
    for i in 0..64 {
        let key = format!("large:{i}");
        let value = vec![b'V'; 3 * LARGE_CHUNK_SZ];
        if !set(&mut fs, key.as_bytes(), &value) {
            break;
        }
        large_stored += 1;
    }
    println!("stored {large_stored} large items");

    // Verify a few survivors round-trip.
    let mut hits = 0usize;
    for i in 0..stored {
        let key = format!("small:{i}");
        if let Some(it) = fs.get(key.as_bytes()) {
            let mut value = vec![0u8; fs.item_nbytes(it)];
            fs.memcpy_from(&mut value, it, key.len(), false);
            assert!(value.iter().all(|&b| b == b'v'));
            fs.deref(it);
            hits += 1;
        }
    }
    println!("{hits} small items still resolvable");
    println!("-- stats after --");
    print!("{}", String::from_utf8_lossy(&fs.allocator_stats()));
}
