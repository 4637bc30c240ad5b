// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Item payload access: the offset-based walker over a title-plus-body
// chain, and the copy/compare operations built on it.
//
// An item's payload is the concatenation `key ‖ value ‖ stamps`, spread
// over the data areas of its chunks: the title holds the first
// `title_data_sz` bytes, each body the next `body_data_sz`.  The walker
// turns an `(offset, len)` request into per-chunk segments; with
// `beyond_item_boundary` the request may run into the unused tail of the
// last chunk (how the timestamp/IP stamps are written).

use crate::layout::*;
use crate::storage::FlatStorage;

impl FlatStorage {
    /// Call `f` with `(segment_ptr, segment_len)` for every region slice
    /// covering `[offset, offset + len)` of the item's payload.
    pub(crate) fn for_each_segment(
        &self,
        it: ItemHandle,
        mut offset: usize,
        mut len: usize,
        beyond_item_boundary: bool,
        mut f: impl FnMut(*mut u8, usize),
    ) {
        let tier = it.tier();
        let (nkey, nbytes) = {
            let h = self.hdr(it);
            (h.nkey as usize, h.nbytes as usize)
        };
        let nchunks = chunks_needed(nkey, nbytes, tier);
        let limit = if beyond_item_boundary {
            chain_capacity(nchunks, tier)
        } else {
            nkey + nbytes
        };
        assert!(offset + len <= limit, "walk beyond item bounds");

        let mut cur = it;
        let mut cap = tier.title_data_sz();
        while len > 0 {
            assert!(!cur.is_none(), "item chain shorter than its sizes claim");
            if offset < cap {
                let n = core::cmp::min(cap - offset, len);
                let p = unsafe { self.chunk_data(cur).add(offset) };
                f(p, n);
                len -= n;
                offset = 0;
            } else {
                offset -= cap;
            }
            if len == 0 {
                break;
            }
            cur = self.next_chunk_of(cur);
            cap = tier.body_data_sz();
        }
    }

    /// Copy `src` into the item payload at `offset`.
    pub fn memcpy_to(
        &mut self,
        it: ItemHandle,
        offset: usize,
        src: &[u8],
        beyond_item_boundary: bool,
    ) {
        let mut pos = 0usize;
        self.for_each_segment(it, offset, src.len(), beyond_item_boundary, |p, n| {
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr().add(pos), p, n) };
            pos += n;
        });
    }

    /// Copy `dst.len()` payload bytes starting at `offset` into `dst`.
    pub fn memcpy_from(
        &self,
        dst: &mut [u8],
        it: ItemHandle,
        offset: usize,
        beyond_item_boundary: bool,
    ) {
        let mut pos = 0usize;
        self.for_each_segment(it, offset, dst.len(), beyond_item_boundary, |p, n| {
            unsafe { core::ptr::copy_nonoverlapping(p, dst.as_mut_ptr().add(pos), n) };
            pos += n;
        });
    }

    /// Whether the item's key equals `key`.
    pub fn key_compare(&self, it: ItemHandle, key: &[u8]) -> bool {
        if self.hdr(it).nkey as usize != key.len() {
            return false;
        }
        let mut equal = true;
        let mut pos = 0usize;
        self.for_each_segment(it, 0, key.len(), false, |p, n| {
            let seg = unsafe { core::slice::from_raw_parts(p, n) };
            if seg != &key[pos..pos + n] {
                equal = false;
            }
            pos += n;
        });
        equal
    }

    /// Borrow the item's key: in place when it is entirely inside the
    /// title chunk, flattened into `scratch` otherwise.
    pub fn key_copy<'a>(
        &'a self,
        it: ItemHandle,
        scratch: &'a mut [u8; KEY_MAX_LENGTH],
    ) -> &'a [u8] {
        let nkey = self.hdr(it).nkey as usize;
        if nkey <= it.tier().title_data_sz() {
            unsafe { core::slice::from_raw_parts(self.chunk_data(it), nkey) }
        } else {
            self.memcpy_from(&mut scratch[..nkey], it, 0, false);
            &scratch[..nkey]
        }
    }

    /// Number of chunks on the item's chain.
    pub fn item_chunk_count(&self, it: ItemHandle) -> usize {
        let mut n = 1usize;
        let mut cur = self.next_chunk_of(it);
        while !cur.is_none() {
            n += 1;
            cur = self.next_chunk_of(cur);
        }
        n
    }

    // -----------------------------------------------------------------------
    // Read-only header views
    // -----------------------------------------------------------------------

    pub fn item_nkey(&self, it: ItemHandle) -> usize {
        self.hdr(it).nkey as usize
    }

    pub fn item_nbytes(&self, it: ItemHandle) -> usize {
        self.hdr(it).nbytes as usize
    }

    /// The ITEM_* flag word.
    pub fn item_it_flags(&self, it: ItemHandle) -> u8 {
        self.hdr(it).it_flags
    }

    /// The caller's opaque flags, as passed to `alloc`.
    pub fn item_user_flags(&self, it: ItemHandle) -> u32 {
        self.hdr(it).flags
    }

    pub fn item_refcount(&self, it: ItemHandle) -> u16 {
        self.hdr(it).refcount
    }

    pub fn item_exptime(&self, it: ItemHandle) -> u32 {
        self.hdr(it).exptime
    }

    pub fn item_time(&self, it: ItemHandle) -> u32 {
        self.hdr(it).time
    }
}
