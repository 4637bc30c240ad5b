// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// The flat storage engine proper: one owner for the region, the chunk
// state tables, both free lists, the LRU endpoints and the counters.
//
// Chunk state lives in engine-side tables (`lflags`, `sflags`,
// `small_allocated`) indexed by chunk position; intrusive links (free-list
// threading, item chains, LRU neighbours) live inside the region itself.
// All operations run to completion under the caller's cache lock — there
// is no internal locking and no suspension point anywhere below.

use std::collections::HashMap;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::assoc::{AssocIndex, HashIndex};
use crate::layout::*;
use crate::region::Region;
use crate::stats::{EngineStats, PrefixRemovals};

/// Runtime knobs read by the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct Settings {
    /// Items last touched at or after this engine-clock second are
    /// considered flushed, whether the sweep or a lookup reaches them
    /// first.  0 disables the global flush.
    pub oldest_live: u32,
    /// Maintain per-prefix removal stats in `unlink`.
    pub detail_enabled: bool,
}

/// The flat storage engine.
///
/// A fixed-capacity, self-managing memory region that is both the item
/// allocator of a key/value cache and the index-free storage backing the
/// items.  Single-writer: the embedding server serialises every call.
pub struct FlatStorage {
    pub(crate) region: Region,

    /// Bytes of the region not yet brought online by `grow()`.
    pub(crate) unused_memory: usize,

    /// State flags per initialised large chunk.
    pub(crate) lflags: Vec<u8>,
    /// State flags per small chunk, `parent * SMALL_CHUNKS_PER_LARGE_CHUNK
    /// + slot`.  Only meaningful while the parent is broken.
    pub(crate) sflags: Vec<u8>,
    /// Number of USED small chunks per parent.
    pub(crate) small_allocated: Vec<u8>,
    /// `broken_histogram[k]` = broken parents with exactly `k` USED
    /// children.
    pub(crate) broken_histogram: [u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],

    pub(crate) large_free_head: ChunkPtr,
    pub(crate) large_free_sz: usize,
    pub(crate) small_free_head: ChunkPtr,
    pub(crate) small_free_sz: usize,

    pub(crate) lru_head: ChunkPtr,
    pub(crate) lru_tail: ChunkPtr,

    /// Engine clock, seconds.  Advanced by the driver via `set_clock`.
    pub(crate) current_time: u32,
    /// Wall-clock epoch seconds at construction; `started + current_time`
    /// is the absolute time used by the stamps and the dump surfaces.
    pub(crate) started: u32,

    pub(crate) settings: Settings,
    pub(crate) stats: EngineStats,
    pub(crate) prefix_removals: HashMap<Vec<u8>, PrefixRemovals>,
    pub(crate) index: Box<dyn AssocIndex>,
}

impl FlatStorage {
    /// Build an engine over `maxbytes` of storage with the bundled hash
    /// index.
    ///
    /// `maxbytes` must be a positive multiple of both [`LARGE_CHUNK_SZ`]
    /// and [`INCREMENT_DELTA`]; violating that is a caller bug and panics.
    pub fn new(maxbytes: usize) -> io::Result<FlatStorage> {
        FlatStorage::with_index(maxbytes, Box::new(HashIndex::new()))
    }

    /// Build an engine over `maxbytes` of storage with a caller-supplied
    /// associative index.
    pub fn with_index(
        maxbytes: usize,
        index: Box<dyn AssocIndex>,
    ) -> io::Result<FlatStorage> {
        assert!(maxbytes > 0, "maxbytes must be positive");
        assert!(
            maxbytes % LARGE_CHUNK_SZ == 0 && maxbytes % INCREMENT_DELTA == 0,
            "maxbytes must be a multiple of LARGE_CHUNK_SZ and INCREMENT_DELTA"
        );

        let region = Region::new(maxbytes)?;
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut fs = FlatStorage {
            region,
            unused_memory: maxbytes,
            lflags: Vec::new(),
            sflags: Vec::new(),
            small_allocated: Vec::new(),
            broken_histogram: [0; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],
            large_free_head: ChunkPtr::NONE,
            large_free_sz: 0,
            small_free_head: ChunkPtr::NONE,
            small_free_sz: 0,
            lru_head: ChunkPtr::NONE,
            lru_tail: ChunkPtr::NONE,
            current_time: 1,
            started,
            settings: Settings::default(),
            stats: EngineStats::default(),
            prefix_removals: HashMap::new(),
            index,
        };

        let grown = fs.grow();
        assert!(grown, "initial grow cannot fail on a validated region");
        Ok(fs)
    }

    // -----------------------------------------------------------------------
    // Environmental scalars and counters
    // -----------------------------------------------------------------------

    /// Advance the engine clock.  Must never move backwards.
    pub fn set_clock(&mut self, now: u32) {
        debug_assert!(now >= self.current_time, "engine clock moved backwards");
        self.current_time = now;
    }

    pub fn current_time(&self) -> u32 {
        self.current_time
    }

    pub fn started(&self) -> u32 {
        self.started
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn unused_memory(&self) -> usize {
        self.unused_memory
    }

    pub fn large_free_list_sz(&self) -> usize {
        self.large_free_sz
    }

    pub fn small_free_list_sz(&self) -> usize {
        self.small_free_sz
    }

    /// Large chunks brought online so far.
    pub fn initialized_chunks(&self) -> usize {
        self.lflags.len()
    }

    // -----------------------------------------------------------------------
    // Region manager
    // -----------------------------------------------------------------------

    /// Bring `INCREMENT_DELTA / LARGE_CHUNK_SZ` more large chunks online,
    /// pushing each onto the large free list.  Fails iff the uninitialised
    /// remainder of the region is smaller than one increment.
    pub fn grow(&mut self) -> bool {
        if INCREMENT_DELTA > self.unused_memory {
            return false;
        }
        let count = INCREMENT_DELTA / LARGE_CHUNK_SZ;
        for _ in 0..count {
            let idx = self.lflags.len() as u32;
            self.lflags.push(CHUNK_INITIALIZED);
            self.sflags
                .resize(self.sflags.len() + SMALL_CHUNKS_PER_LARGE_CHUNK, 0);
            self.small_allocated.push(0);
            self.free_chunk(ChunkPtr::large(idx), false);
        }
        self.unused_memory -= INCREMENT_DELTA;
        true
    }

    // -----------------------------------------------------------------------
    // Raw chunk addressing
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn sidx(cp: ChunkPtr) -> usize {
        cp.parent() as usize * SMALL_CHUNKS_PER_LARGE_CHUNK + cp.slot() as usize
    }

    #[inline]
    pub(crate) fn chunk_base(&self, cp: ChunkPtr) -> *mut u8 {
        debug_assert!(!cp.is_none());
        let off = if cp.is_small() {
            cp.parent() as usize * LARGE_CHUNK_SZ + cp.slot() as usize * SMALL_CHUNK_SZ
        } else {
            cp.large_index() as usize * LARGE_CHUNK_SZ
        };
        debug_assert!(off < self.lflags.len() * LARGE_CHUNK_SZ);
        unsafe { self.region.base().add(off) }
    }

    #[inline]
    pub(crate) fn flags_of(&self, cp: ChunkPtr) -> u8 {
        if cp.is_small() {
            self.sflags[Self::sidx(cp)]
        } else {
            self.lflags[cp.large_index() as usize]
        }
    }

    #[inline]
    pub(crate) fn set_flags(&mut self, cp: ChunkPtr, flags: u8) {
        if cp.is_small() {
            self.sflags[Self::sidx(cp)] = flags;
        } else {
            self.lflags[cp.large_index() as usize] = flags;
        }
    }

    #[inline]
    pub(crate) fn is_title(&self, cp: ChunkPtr) -> bool {
        self.flags_of(cp) & CHUNK_TITLE != 0
    }

    // -----------------------------------------------------------------------
    // In-region header access
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn hdr(&self, it: ItemHandle) -> &ItemHeader {
        debug_assert!(self.is_title(it));
        unsafe { &*(self.chunk_base(it) as *const ItemHeader) }
    }

    #[inline]
    pub(crate) fn hdr_mut(&mut self, it: ItemHandle) -> &mut ItemHeader {
        debug_assert!(self.is_title(it));
        unsafe { &mut *(self.chunk_base(it) as *mut ItemHeader) }
    }

    /// Start of a chunk's payload data area (after its header).
    #[inline]
    pub(crate) fn chunk_data(&self, cp: ChunkPtr) -> *mut u8 {
        let off = if self.is_title(cp) {
            ITEM_HEADER_SZ
        } else if cp.is_small() {
            core::mem::size_of::<SmallBodyHeader>()
        } else {
            core::mem::size_of::<LargeBodyHeader>()
        };
        unsafe { self.chunk_base(cp).add(off) }
    }

    /// Forward chain link of a title or body chunk.
    #[inline]
    pub(crate) fn next_chunk_of(&self, cp: ChunkPtr) -> ChunkPtr {
        if self.is_title(cp) {
            self.hdr(cp).next_chunk
        } else if cp.is_small() {
            unsafe { (*(self.chunk_base(cp) as *const SmallBodyHeader)).next_chunk }
        } else {
            unsafe { (*(self.chunk_base(cp) as *const LargeBodyHeader)).next_chunk }
        }
    }

    #[inline]
    pub(crate) fn set_next_chunk_of(&mut self, cp: ChunkPtr, v: ChunkPtr) {
        if self.is_title(cp) {
            self.hdr_mut(cp).next_chunk = v;
        } else if cp.is_small() {
            unsafe { (*(self.chunk_base(cp) as *mut SmallBodyHeader)).next_chunk = v }
        } else {
            unsafe { (*(self.chunk_base(cp) as *mut LargeBodyHeader)).next_chunk = v }
        }
    }

    /// Back link of a small body chunk.
    #[inline]
    pub(crate) fn body_prev(&self, cp: ChunkPtr) -> ChunkPtr {
        debug_assert!(cp.is_small() && !self.is_title(cp));
        unsafe { (*(self.chunk_base(cp) as *const SmallBodyHeader)).prev_chunk }
    }

    #[inline]
    pub(crate) fn set_body_prev(&mut self, cp: ChunkPtr, v: ChunkPtr) {
        debug_assert!(cp.is_small() && !self.is_title(cp));
        unsafe { (*(self.chunk_base(cp) as *mut SmallBodyHeader)).prev_chunk = v }
    }

    #[inline]
    fn free_hdr(&self, cp: ChunkPtr) -> *mut FreeHeader {
        self.chunk_base(cp) as *mut FreeHeader
    }

    #[inline]
    pub(crate) fn free_next(&self, cp: ChunkPtr) -> ChunkPtr {
        unsafe { (*self.free_hdr(cp)).next }
    }

    // -----------------------------------------------------------------------
    // Free lists
    // -----------------------------------------------------------------------

    /// Release a chunk back to its tier's free list.  The chunk must be
    /// initialised and off the list; USED and TITLE bits are cleared
    /// here.  `try_merge` asks the small path to attempt an opportunistic
    /// unbreak of the parent.
    pub(crate) fn free_chunk(&mut self, cp: ChunkPtr, try_merge: bool) {
        let f = self.flags_of(cp);
        assert!(f & CHUNK_INITIALIZED != 0, "freeing uninitialised chunk");
        assert!(f & CHUNK_FREE == 0, "double free of chunk");

        if cp.is_small() {
            assert!(f & CHUNK_COALESCE_PENDING == 0, "freeing pending chunk");
            let parent = cp.parent();
            if f & CHUNK_USED != 0 {
                self.bump_allocated(parent, -1);
            }
            self.set_flags(cp, CHUNK_INITIALIZED | CHUNK_FREE);
            self.push_small_raw(cp);
            if try_merge {
                self.unbreak(parent, false);
            }
        } else {
            assert!(f & CHUNK_BROKEN == 0, "freeing a broken chunk whole");
            self.set_flags(cp, CHUNK_INITIALIZED | CHUNK_FREE);
            unsafe {
                (*self.free_hdr(cp)).next = self.large_free_head;
            }
            self.large_free_head = cp;
            self.large_free_sz += 1;
        }
    }

    /// Pop a large chunk.  The result is initialised, off-list, and not
    /// yet USED (so it can be broken or turned into an item chunk).
    pub(crate) fn pop_large(&mut self) -> Option<ChunkPtr> {
        let cp = self.large_free_head;
        if cp.is_none() {
            return None;
        }
        debug_assert!(self.flags_of(cp) & CHUNK_FREE != 0);
        self.large_free_head = self.free_next(cp);
        self.large_free_sz -= 1;
        self.set_flags(cp, CHUNK_INITIALIZED);
        Some(cp)
    }

    /// Pop a small chunk.  The result is flagged USED and counted against
    /// its parent; the caller adds TITLE when appropriate.
    pub(crate) fn pop_small(&mut self) -> Option<ChunkPtr> {
        let cp = self.small_free_head;
        if cp.is_none() {
            return None;
        }
        self.unlink_small(cp);
        self.set_flags(cp, CHUNK_INITIALIZED | CHUNK_USED);
        self.bump_allocated(cp.parent(), 1);
        Some(cp)
    }

    /// Thread a small chunk onto the head of the small free list.
    pub(crate) fn push_small_raw(&mut self, cp: ChunkPtr) {
        let old_head = self.small_free_head;
        unsafe {
            let h = self.free_hdr(cp);
            (*h).next = old_head;
            (*h).prev_next = ChunkPtr::NONE;
        }
        if !old_head.is_none() {
            unsafe { (*self.free_hdr(old_head)).prev_next = cp };
        }
        self.small_free_head = cp;
        self.small_free_sz += 1;
    }

    /// Unthread a small chunk from anywhere in the small free list in
    /// O(1) via its `prev_next` link.
    pub(crate) fn unlink_small(&mut self, cp: ChunkPtr) {
        debug_assert!(self.flags_of(cp) & CHUNK_FREE != 0);
        let (next, prev_next) = unsafe {
            let h = self.free_hdr(cp);
            ((*h).next, (*h).prev_next)
        };
        if prev_next.is_none() {
            debug_assert!(self.small_free_head == cp);
            self.small_free_head = next;
        } else {
            unsafe { (*self.free_hdr(prev_next)).next = next };
        }
        if !next.is_none() {
            unsafe { (*self.free_hdr(next)).prev_next = prev_next };
        }
        self.small_free_sz -= 1;
    }

    // -----------------------------------------------------------------------
    // Break / unbreak
    // -----------------------------------------------------------------------

    /// Move the per-parent USED count by `delta`, keeping the occupancy
    /// histogram in step.
    pub(crate) fn bump_allocated(&mut self, parent: u32, delta: i32) {
        let p = parent as usize;
        let old = self.small_allocated[p] as i32;
        let new = old + delta;
        assert!(
            new >= 0 && new <= SMALL_CHUNKS_PER_LARGE_CHUNK as i32,
            "allocated count out of range"
        );
        self.broken_histogram[old as usize] -= 1;
        self.broken_histogram[new as usize] += 1;
        self.small_allocated[p] = new as u8;
    }

    /// Subdivide a freshly popped large chunk into small chunks, pushing
    /// every child onto the small free list.  Children are pushed in
    /// reverse slot order so the head-most entries carry the lowest
    /// slots (a convention, nothing relies on it).
    pub(crate) fn break_chunk(&mut self, cp: ChunkPtr) {
        let f = self.flags_of(cp);
        assert!(
            f & CHUNK_INITIALIZED != 0 && f & (CHUNK_USED | CHUNK_FREE) == 0,
            "break of an unavailable chunk"
        );
        let parent = cp.large_index();
        self.set_flags(cp, CHUNK_INITIALIZED | CHUNK_USED | CHUNK_BROKEN);
        self.small_allocated[parent as usize] = 0;
        self.broken_histogram[0] += 1;
        for slot in (0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32).rev() {
            let sc = ChunkPtr::small(parent, slot);
            self.set_flags(sc, CHUNK_INITIALIZED | CHUNK_FREE);
            self.push_small_raw(sc);
        }
        self.stats.break_events += 1;
    }

    /// Reassemble a broken parent into a whole large free chunk.
    ///
    /// The non-mandatory form is the opportunistic merge tried on every
    /// small-chunk release and no-ops while any child is USED.  The
    /// mandatory form is the coalescer's final step, where every child is
    /// already FREE or COALESCE_PENDING.
    pub(crate) fn unbreak(&mut self, parent: u32, mandatory: bool) -> bool {
        let lcp = ChunkPtr::large(parent);
        let lf = self.flags_of(lcp);
        assert!(
            lf & CHUNK_USED != 0 && lf & CHUNK_BROKEN != 0,
            "unbreak of a chunk that is not broken"
        );

        if self.small_allocated[parent as usize] != 0 {
            assert!(!mandatory, "mandatory unbreak of a populated parent");
            return false;
        }

        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32 {
            let sc = ChunkPtr::small(parent, slot);
            let sf = self.flags_of(sc);
            assert!(sf & CHUNK_USED == 0, "unbreak with a used child");
            if sf & CHUNK_FREE != 0 {
                self.unlink_small(sc);
            }
            // COALESCE_PENDING children are simply released.
            self.set_flags(sc, 0);
        }

        self.broken_histogram[0] -= 1;
        self.set_flags(lcp, CHUNK_INITIALIZED);
        self.free_chunk(lcp, false);
        self.stats.unbreak_events += 1;
        true
    }

    // -----------------------------------------------------------------------
    // Consistency checking
    // -----------------------------------------------------------------------

    /// Full structural audit of the chunk tables, free lists and LRU
    /// endpoints.  Meant for tests and debugging; cost is linear in the
    /// initialised region.  Panics on the first violation.
    pub fn check_consistency(&self) {
        assert_eq!(
            self.unused_memory,
            self.region.len() - self.lflags.len() * LARGE_CHUNK_SZ,
            "unused_memory out of step with initialised chunks"
        );

        // Large-chunk census: every chunk in exactly one state.
        let mut free_large = 0usize;
        let mut census = [0u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1];
        for idx in 0..self.lflags.len() {
            let f = self.lflags[idx];
            assert!(f & CHUNK_INITIALIZED != 0);
            let is_free = f & CHUNK_FREE != 0;
            let is_used = f & CHUNK_USED != 0;
            assert!(is_free != is_used, "large chunk neither free nor used");
            if is_free {
                free_large += 1;
                continue;
            }
            if f & CHUNK_BROKEN == 0 {
                continue;
            }

            // Small-chunk census within the parent.
            let mut used = 0usize;
            let mut states = 0usize;
            for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32 {
                let sf = self.sflags[idx * SMALL_CHUNKS_PER_LARGE_CHUNK + slot as usize];
                assert!(sf & CHUNK_INITIALIZED != 0);
                let one_of = [
                    sf & CHUNK_FREE != 0,
                    sf & CHUNK_USED != 0,
                    sf & CHUNK_COALESCE_PENDING != 0,
                ];
                assert_eq!(
                    one_of.iter().filter(|&&b| b).count(),
                    1,
                    "small chunk not in exactly one usage state"
                );
                states += 1;
                if sf & CHUNK_USED != 0 {
                    used += 1;
                }
            }
            assert_eq!(states, SMALL_CHUNKS_PER_LARGE_CHUNK);
            assert_eq!(
                used,
                self.small_allocated[idx] as usize,
                "allocated count out of step with used children"
            );
            census[used] += 1;
        }
        assert_eq!(free_large, self.large_free_sz, "large free counter drift");
        assert_eq!(
            census, self.broken_histogram,
            "broken-chunk histogram disagrees with census"
        );

        // Large free list: length matches, every node flagged FREE.
        let mut walked = 0usize;
        let mut cur = self.large_free_head;
        while !cur.is_none() {
            walked += 1;
            assert!(walked <= self.large_free_sz, "large free list cycle");
            assert!(self.flags_of(cur) & CHUNK_FREE != 0);
            cur = self.free_next(cur);
        }
        assert_eq!(walked, self.large_free_sz, "large free list length drift");

        // Small free list: length matches and every node satisfies the
        // prev-pointer-to-next-slot invariant.
        let mut walked = 0usize;
        let mut cur = self.small_free_head;
        while !cur.is_none() {
            walked += 1;
            assert!(walked <= self.small_free_sz, "small free list cycle");
            assert!(self.flags_of(cur) & CHUNK_FREE != 0);
            let (next, prev_next) = unsafe {
                let h = self.free_hdr(cur);
                ((*h).next, (*h).prev_next)
            };
            if prev_next.is_none() {
                assert!(self.small_free_head == cur, "orphan head link");
            } else {
                assert!(self.free_next(prev_next) == cur, "broken prev_next thread");
            }
            cur = next;
        }
        assert_eq!(walked, self.small_free_sz, "small free list length drift");

        assert_eq!(
            self.lru_head.is_none(),
            self.lru_tail.is_none(),
            "LRU endpoints disagree"
        );
    }
}
