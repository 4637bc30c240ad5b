// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// The coalescer: reclaims whole large chunks from small-tier
// fragmentation by migrating every live small chunk off a chosen broken
// parent, then unbreaking it.
//
// The drain runs in two passes.  First every FREE child of the parent is
// pulled off the small free list and parked as COALESCE_PENDING —
// otherwise the migrator could pick a same-parent chunk as a replacement
// target and defeat the consolidation.  Then each USED child is copied to
// a replacement popped from the (now parent-free) list, and every
// back-reference to the old chunk is repaired: LRU neighbours, the item
// chain, and the external index binding for titles.

use crate::layout::*;
use crate::storage::FlatStorage;

/// Outcome of a coalescing pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CoalesceResult {
    /// At least one broken parent was reassembled into a large free chunk.
    LargeChunkFormed,
    /// No unreferenced broken parent could be found.
    NoProgress,
}

impl FlatStorage {
    /// Drain small-tier fragmentation into whole large chunks for as long
    /// as a parent's worth of small free chunks remains.
    pub fn coalesce(&mut self) -> CoalesceResult {
        let mut formed = false;
        while self.small_free_sz >= SMALL_CHUNKS_PER_LARGE_CHUNK {
            let parent = match self.find_unreferenced_broken(0) {
                Some(p) => p,
                None => break,
            };
            self.drain_parent(parent);
            formed = true;
        }
        if formed {
            CoalesceResult::LargeChunkFormed
        } else {
            CoalesceResult::NoProgress
        }
    }

    /// Scan the small free list (at most `depth` nodes, 0 = unbounded)
    /// for a parent with no referenced child.  A child is referenced iff
    /// it is USED and the title of its item carries `refcount > 0`; FREE
    /// and COALESCE_PENDING children never pin their parent.
    fn find_unreferenced_broken(&self, depth: usize) -> Option<u32> {
        let mut cur = self.small_free_head;
        let mut inspected = 0usize;
        while !cur.is_none() {
            if depth != 0 && inspected >= depth {
                break;
            }
            inspected += 1;
            let parent = cur.parent();
            if !self.has_referenced_child(parent) {
                return Some(parent);
            }
            cur = self.free_next(cur);
        }
        None
    }

    fn has_referenced_child(&self, parent: u32) -> bool {
        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32 {
            let cp = ChunkPtr::small(parent, slot);
            if self.flags_of(cp) & CHUNK_USED == 0 {
                continue;
            }
            let title = self.title_of(cp);
            if self.hdr(title).refcount > 0 {
                return true;
            }
        }
        false
    }

    /// Walk `prev_chunk` links from a used small chunk up to its title.
    pub(crate) fn title_of(&self, cp: ChunkPtr) -> ItemHandle {
        let mut cur = cp;
        while !self.is_title(cur) {
            cur = self.body_prev(cur);
        }
        cur
    }

    /// Empty one unreferenced broken parent and unbreak it.
    fn drain_parent(&mut self, parent: u32) {
        // Pass 1: withdraw the parent's free children from circulation.
        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32 {
            let cp = ChunkPtr::small(parent, slot);
            if self.flags_of(cp) & CHUNK_FREE != 0 {
                self.unlink_small(cp);
                self.set_flags(cp, CHUNK_INITIALIZED | CHUNK_COALESCE_PENDING);
            }
        }

        // Pass 2: migrate the used children to replacements elsewhere.
        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK as u32 {
            let old = ChunkPtr::small(parent, slot);
            let f = self.flags_of(old);
            if f & CHUNK_USED == 0 {
                continue;
            }

            let repl = self
                .pop_small()
                .expect("small free list underflow during coalesce");
            debug_assert!(repl.parent() != parent, "replacement on the drained parent");

            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.chunk_base(old),
                    self.chunk_base(repl),
                    SMALL_CHUNK_SZ,
                );
            }

            if f & CHUNK_TITLE != 0 {
                self.set_flags(repl, CHUNK_INITIALIZED | CHUNK_USED | CHUNK_TITLE);
                self.repoint_title(old, repl);
            } else {
                self.set_flags(repl, CHUNK_INITIALIZED | CHUNK_USED);
                self.repoint_body(repl);
            }

            self.set_flags(old, CHUNK_INITIALIZED | CHUNK_COALESCE_PENDING);
            self.bump_allocated(parent, -1);
            self.stats.migrates += 1;
        }

        debug_assert_eq!(self.small_allocated[parent as usize], 0);
        self.unbreak(parent, true);
    }

    /// Repair every reference to a migrated title: LRU neighbours (or the
    /// endpoints), the first body's back link, and the index binding.
    fn repoint_title(&mut self, old: ChunkPtr, repl: ChunkPtr) {
        let (prev, next, first_body, refcount, it_flags, nkey) = {
            let h = self.hdr(repl);
            (
                h.prev,
                h.next,
                h.next_chunk,
                h.refcount,
                h.it_flags,
                h.nkey as usize,
            )
        };
        assert_eq!(refcount, 0, "migrating a held title");
        assert!(it_flags & ITEM_LINKED != 0, "migrating an unlinked title");

        if prev.is_none() {
            debug_assert!(self.lru_head == old);
            self.lru_head = repl;
        } else {
            self.hdr_mut(prev).next = repl;
        }
        if next.is_none() {
            debug_assert!(self.lru_tail == old);
            self.lru_tail = repl;
        } else {
            self.hdr_mut(next).prev = repl;
        }
        if !first_body.is_none() {
            self.set_body_prev(first_body, repl);
        }

        let mut kbuf = [0u8; KEY_MAX_LENGTH];
        self.memcpy_from(&mut kbuf[..nkey], repl, 0, false);
        self.index.update(&kbuf[..nkey], old, repl);
    }

    /// Repair the chain links around a migrated body: the predecessor's
    /// forward link and the successor's back link.
    fn repoint_body(&mut self, repl: ChunkPtr) {
        let (pred, succ) = (self.body_prev(repl), self.next_chunk_of(repl));
        debug_assert!(!pred.is_none(), "body chunk with no predecessor");
        self.set_next_chunk_of(pred, repl);
        if !succ.is_none() {
            self.set_body_prev(succ, repl);
        }
    }
}
