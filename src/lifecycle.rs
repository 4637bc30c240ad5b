// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Item lifecycle: publication into the index + LRU, retrieval, reference
// management, and physical reclamation.
//
// An item is reclaimed exactly once, when both conditions hold: no
// outstanding holder (`refcount == 0`) and not published (`LINKED`
// cleared).  `unlink` and `deref` each check for the other condition, so
// whichever happens last frees the chain.

use crate::layout::*;
use crate::storage::FlatStorage;

/// Why an item is being unlinked; drives the eviction/expiry counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnlinkCause {
    /// Caller-requested removal (delete, replace).
    Explicit,
    /// Reclaimed by the eviction driver; counted as an eviction unless
    /// the item had already expired.
    MaybeEvict,
    /// Removed because its expiry or a global flush had passed.
    Expired,
}

impl FlatStorage {
    /// Publish a fresh allocation under `key`: index insert plus LRU push.
    pub fn link(&mut self, it: ItemHandle, key: &[u8]) {
        let now = self.current_time;
        let (nkey, nbytes) = {
            let h = self.hdr_mut(it);
            assert!(h.it_flags & ITEM_VALID != 0, "link of an unstamped item");
            assert!(h.it_flags & ITEM_LINKED == 0, "double link");
            debug_assert_eq!(h.nkey as usize, key.len());
            h.it_flags |= ITEM_LINKED;
            h.time = now;
            (h.nkey as u64, h.nbytes as u64)
        };
        self.index.insert(key, it);
        self.stats.curr_items += 1;
        self.stats.total_items += 1;
        self.stats.curr_bytes += nkey + nbytes;
        self.link_q(it);
    }

    /// Withdraw an item from the index and LRU, freeing it if nobody
    /// holds a reference.  `key` may be omitted; it is then flattened
    /// from the chain.  No-op on an unlinked item.
    pub fn unlink(&mut self, it: ItemHandle, cause: UnlinkCause, key: Option<&[u8]>) {
        let (it_flags, nkey, nbytes, exptime, refcount) = {
            let h = self.hdr(it);
            (
                h.it_flags,
                h.nkey as usize,
                h.nbytes as usize,
                h.exptime,
                h.refcount,
            )
        };
        if it_flags & ITEM_LINKED == 0 {
            return;
        }

        let mut kbuf = [0u8; KEY_MAX_LENGTH];
        let key: &[u8] = match key {
            Some(k) => k,
            None => {
                self.memcpy_from(&mut kbuf[..nkey], it, 0, false);
                &kbuf[..nkey]
            }
        };

        match cause {
            UnlinkCause::MaybeEvict => {
                if exptime == 0 || exptime > self.current_time {
                    self.stats.evictions += 1;
                } else {
                    self.stats.expirations += 1;
                }
            }
            UnlinkCause::Expired => self.stats.expirations += 1,
            UnlinkCause::Explicit => {}
        }

        self.hdr_mut(it).it_flags &= !ITEM_LINKED;
        self.stats.curr_items -= 1;
        self.stats.curr_bytes -= (nkey + nbytes) as u64;
        if self.settings.detail_enabled {
            self.record_prefix_removal(key, nkey + nbytes);
        }
        self.index.delete(key);
        self.hdr_mut(it).h_next = ChunkPtr::NONE;
        self.unlink_q(it);

        if refcount == 0 {
            self.free_item(it);
        }
    }

    /// Drop one caller reference; reclaims the item when it was the last
    /// holder of an already-unlinked item.
    pub fn deref(&mut self, it: ItemHandle) {
        let (refcount, it_flags) = {
            let h = self.hdr_mut(it);
            if h.refcount > 0 {
                h.refcount -= 1;
            }
            (h.refcount, h.it_flags)
        };
        if refcount == 0 && it_flags & ITEM_LINKED == 0 {
            self.free_item(it);
        }
    }

    /// Atomically swap the binding of `key`: unlink `old`, link `new`.
    pub fn replace(&mut self, old: ItemHandle, new: ItemHandle, key: &[u8]) {
        self.unlink(old, UnlinkCause::Explicit, Some(key));
        self.link(new, key);
    }

    /// Look up `key`, honouring delete locks, global flush and expiry.
    /// On a hit the item's refcount is bumped; pair with `deref`.
    pub fn get(&mut self, key: &[u8]) -> Option<ItemHandle> {
        self.get_internal(key, None)
    }

    /// Like `get`, but additionally reports whether a miss was caused by
    /// an unexpired delete lock.
    pub fn get_notedeleted(
        &mut self,
        key: &[u8],
        delete_locked: &mut bool,
    ) -> Option<ItemHandle> {
        self.get_internal(key, Some(delete_locked))
    }

    /// Bare index lookup: no delete-lock, flush or expiry handling.
    pub fn get_nocheck(&mut self, key: &[u8]) -> Option<ItemHandle> {
        let it = self.index.find(key)?;
        self.hdr_mut(it).refcount += 1;
        Some(it)
    }

    fn get_internal(
        &mut self,
        key: &[u8],
        mut delete_locked: Option<&mut bool>,
    ) -> Option<ItemHandle> {
        if let Some(l) = delete_locked.as_mut() {
            **l = false;
        }
        let it = self.index.find(key)?;
        let (it_flags, exptime, time) = {
            let h = self.hdr(it);
            (h.it_flags, h.exptime, h.time)
        };

        let deleted = it_flags & ITEM_DELETED != 0;
        if deleted && self.current_time <= exptime {
            // Delete lock still running: the key reads as a miss.
            if let Some(l) = delete_locked {
                *l = true;
            }
            return None;
        }

        // Same predicate as flush_expired: items touched at or after the
        // flush point are flushed, whichever path reaches them first.
        let oldest = self.settings.oldest_live;
        if oldest != 0 && oldest <= self.current_time && time >= oldest {
            self.unlink(it, UnlinkCause::Expired, Some(key));
            return None;
        }
        if !deleted && exptime != 0 && exptime <= self.current_time {
            self.unlink(it, UnlinkCause::Expired, Some(key));
            return None;
        }

        self.hdr_mut(it).refcount += 1;
        Some(it)
    }

    /// Delete-lock an item until `lock_until` (engine clock).  While the
    /// lock runs, `get` misses and `get_notedeleted` reports the lock.
    pub fn mark_deleted(&mut self, it: ItemHandle, lock_until: u32) {
        let h = self.hdr_mut(it);
        h.it_flags |= ITEM_DELETED;
        h.exptime = lock_until;
    }

    pub fn clear_deleted(&mut self, it: ItemHandle) {
        self.hdr_mut(it).it_flags &= !ITEM_DELETED;
    }

    /// Unlink every item touched at or after `settings.oldest_live`.
    ///
    /// Walks from the head and stops at the first older item, which is
    /// sound because head insertion keeps `time` non-increasing along the
    /// list.
    pub fn flush_expired(&mut self) {
        if self.settings.oldest_live == 0 {
            return;
        }
        let oldest = self.settings.oldest_live;
        let mut cur = self.lru_head;
        while !cur.is_none() {
            let (time, next) = {
                let h = self.hdr(cur);
                (h.time, h.next)
            };
            if time < oldest {
                break;
            }
            self.unlink(cur, UnlinkCause::Expired, None);
            cur = next;
        }
    }

    /// Return every chunk of the chain to the free lists.  Small-tier
    /// releases try an opportunistic unbreak of each parent.
    pub(crate) fn free_item(&mut self, it: ItemHandle) {
        let first_body = {
            let h = self.hdr(it);
            assert!(h.refcount == 0, "freeing a held item");
            assert!(h.it_flags & ITEM_LINKED == 0, "freeing a linked item");
            assert!(
                h.next.is_none() && h.prev.is_none() && h.h_next.is_none(),
                "freeing an item still threaded somewhere"
            );
            h.next_chunk
        };
        let try_merge = it.tier() == Tier::Small;

        let mut cur = first_body;
        while !cur.is_none() {
            let next = self.next_chunk_of(cur);
            self.free_chunk(cur, try_merge);
            cur = next;
        }
        self.free_chunk(it, try_merge);
    }
}
