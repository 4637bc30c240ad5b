// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Text reporting surfaces: allocator stats, per-size item histogram and
// the LRU cachedump.  All three render the classic line-per-stat format
// with a trailing `END\r\n`; keys are emitted as raw bytes because they
// are not required to be UTF-8.

use std::collections::BTreeMap;

use crate::layout::*;
use crate::storage::FlatStorage;

/// Upper bound on a cachedump buffer.
const CACHEDUMP_BUF_CAP: usize = 2 * 1024 * 1024;

/// Size granularity of the `stats_sizes` histogram.
const SIZES_BUCKET: usize = 32;

fn put_stat(out: &mut Vec<u8>, name: &str, value: u64) {
    out.extend_from_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
}

impl FlatStorage {
    /// Allocator-level statistics: layout constants, chunk populations,
    /// the broken-chunk occupancy histogram and the event counters.
    pub fn allocator_stats(&self) -> Vec<u8> {
        let mut free_large = 0u64;
        let mut title_large = 0u64;
        let mut body_large = 0u64;
        let mut broken_large = 0u64;
        for &f in &self.lflags {
            if f & CHUNK_FREE != 0 {
                free_large += 1;
            } else if f & CHUNK_BROKEN != 0 {
                broken_large += 1;
            } else if f & CHUNK_TITLE != 0 {
                title_large += 1;
            } else {
                body_large += 1;
            }
        }

        let mut free_small = 0u64;
        let mut title_small = 0u64;
        let mut body_small = 0u64;
        let mut pending_small = 0u64;
        for (idx, &f) in self.lflags.iter().enumerate() {
            if f & CHUNK_BROKEN == 0 {
                continue;
            }
            for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                let sf = self.sflags[idx * SMALL_CHUNKS_PER_LARGE_CHUNK + slot];
                if sf & CHUNK_FREE != 0 {
                    free_small += 1;
                } else if sf & CHUNK_COALESCE_PENDING != 0 {
                    pending_small += 1;
                } else if sf & CHUNK_TITLE != 0 {
                    title_small += 1;
                } else {
                    body_small += 1;
                }
            }
        }

        let oldest_lifetime = if self.lru_tail.is_none() {
            0
        } else {
            u64::from(self.current_time - self.hdr(self.lru_tail).time)
        };

        let mut out = Vec::new();
        put_stat(&mut out, "large_chunk_sz", LARGE_CHUNK_SZ as u64);
        put_stat(&mut out, "small_chunk_sz", SMALL_CHUNK_SZ as u64);
        put_stat(&mut out, "large_chunks_initialized", self.lflags.len() as u64);
        put_stat(&mut out, "large_chunks_free", free_large);
        put_stat(&mut out, "large_chunks_title", title_large);
        put_stat(&mut out, "large_chunks_body", body_large);
        put_stat(&mut out, "large_chunks_broken", broken_large);
        put_stat(&mut out, "small_chunks_free", free_small);
        put_stat(&mut out, "small_chunks_title", title_small);
        put_stat(&mut out, "small_chunks_body", body_small);
        put_stat(&mut out, "small_chunks_coalesce_pending", pending_small);
        for (k, &count) in self.broken_histogram.iter().enumerate() {
            put_stat(&mut out, &format!("broken_chunk_histogram_{}", k), count);
        }
        put_stat(&mut out, "break_events", self.stats.break_events);
        put_stat(&mut out, "unbreak_events", self.stats.unbreak_events);
        put_stat(&mut out, "migrates", self.stats.migrates);
        put_stat(&mut out, "unused_memory", self.unused_memory as u64);
        put_stat(&mut out, "large_free_list_sz", self.large_free_sz as u64);
        put_stat(&mut out, "small_free_list_sz", self.small_free_sz as u64);
        put_stat(&mut out, "oldest_item_lifetime", oldest_lifetime);
        out.extend_from_slice(b"END\r\n");
        out
    }

    /// Histogram of linked item sizes in `SIZES_BUCKET`-byte buckets.
    /// Each item is counted once, via a single LRU walk.
    pub fn stats_sizes(&self) -> Vec<u8> {
        let mut buckets: BTreeMap<usize, u64> = BTreeMap::new();
        let mut cur = self.lru_head;
        while !cur.is_none() {
            let h = self.hdr(cur);
            let ntotal = ITEM_HEADER_SZ + h.nkey as usize + h.nbytes as usize;
            let bucket = (ntotal + SIZES_BUCKET - 1) / SIZES_BUCKET * SIZES_BUCKET;
            *buckets.entry(bucket).or_insert(0) += 1;
            cur = h.next;
        }

        let mut out = Vec::new();
        for (bucket, count) in buckets {
            out.extend_from_slice(format!("{} {}\r\n", bucket, count).as_bytes());
        }
        out.extend_from_slice(b"END\r\n");
        out
    }

    /// Dump up to `limit` items of `tier` (0 = no limit) in LRU order,
    /// capped at 2 MiB of output.
    pub fn cachedump(&self, tier: Tier, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut shown = 0usize;
        let mut cur = self.lru_head;
        while !cur.is_none() && (limit == 0 || shown < limit) {
            let next = self.hdr(cur).next;
            if cur.tier() == tier {
                let (nbytes, time) = {
                    let h = self.hdr(cur);
                    (h.nbytes, h.time)
                };
                let mut scratch = [0u8; KEY_MAX_LENGTH];
                let key = self.key_copy(cur, &mut scratch);
                let suffix = format!(
                    " [{} b; {} s]\r\n",
                    nbytes,
                    u64::from(self.started) + u64::from(time)
                );
                if out.len() + b"ITEM ".len() + key.len() + suffix.len() + b"END\r\n".len()
                    > CACHEDUMP_BUF_CAP
                {
                    break;
                }
                out.extend_from_slice(b"ITEM ");
                out.extend_from_slice(key);
                out.extend_from_slice(suffix.as_bytes());
                shown += 1;
            }
            cur = next;
        }
        out.extend_from_slice(b"END\r\n");
        out
    }
}
