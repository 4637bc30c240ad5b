// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Allocation: tier selection, free-list replenishment and chain assembly.
//
// Replenishment tries progressively more expensive strategies per
// iteration — grow the region, coalesce fragmentation into whole large
// chunks, evict from the LRU tail — and gives up only when a full pass
// moves neither free-list counter.  Nothing item-visible changes on a
// failed allocation.

use std::net::Ipv4Addr;

use crate::layout::*;
use crate::lifecycle::UnlinkCause;
use crate::storage::FlatStorage;

impl FlatStorage {
    /// Whether an item of this shape is accepted at all.
    pub fn size_ok(&self, nkey: usize, _flags: u32, nbytes: usize) -> bool {
        nkey != 0 && nkey <= KEY_MAX_LENGTH && nbytes <= MAX_ITEM_SIZE
    }

    /// Whether replacing `it`'s payload with the new shape requires a
    /// fresh allocation (tier change or a different chunk count).
    pub fn need_realloc(
        &self,
        it: ItemHandle,
        new_nkey: usize,
        _new_flags: u32,
        new_nbytes: usize,
    ) -> bool {
        let tier = it.tier();
        let new_large = is_large_chunk(new_nkey, new_nbytes);
        if (tier == Tier::Large) != new_large {
            return true;
        }
        let (nkey, nbytes) = {
            let h = self.hdr(it);
            (h.nkey as usize, h.nbytes as usize)
        };
        chunks_needed(nkey, nbytes, tier) != chunks_needed(new_nkey, new_nbytes, tier)
    }

    /// Allocate an unlinked item with `refcount == 1`.
    ///
    /// The key is copied into the chain; the caller writes the value via
    /// [`memcpy_to`](Self::memcpy_to) at offset `nkey` and then `link`s.
    /// If tail slack allows, an absolute timestamp and `ip` are stamped
    /// after the value (timestamp first, each flagged in `it_flags`).
    /// Returns `None` when the shape is oversized or every replenishment
    /// strategy is exhausted.
    pub fn alloc(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: u32,
        nbytes: usize,
        ip: Ipv4Addr,
    ) -> Option<ItemHandle> {
        let nkey = key.len();
        if !self.size_ok(nkey, flags, nbytes) {
            return None;
        }

        let tier = if is_large_chunk(nkey, nbytes) {
            Tier::Large
        } else {
            Tier::Small
        };
        let needed = chunks_needed(nkey, nbytes, tier);

        if !self.replenish(tier, needed) {
            return None;
        }

        // Assemble the chain.  The free lists hold `needed` chunks now, so
        // the pops below cannot fail.
        let title = match tier {
            Tier::Large => {
                let c = self.pop_large().expect("replenished large list empty");
                self.set_flags(c, CHUNK_INITIALIZED | CHUNK_USED | CHUNK_TITLE);
                c
            }
            Tier::Small => {
                let c = self.pop_small().expect("replenished small list empty");
                self.set_flags(c, CHUNK_INITIALIZED | CHUNK_USED | CHUNK_TITLE);
                c
            }
        };

        {
            let now = self.current_time;
            let h = self.hdr_mut(title);
            h.next = ChunkPtr::NONE;
            h.prev = ChunkPtr::NONE;
            h.h_next = ChunkPtr::NONE;
            h.next_chunk = ChunkPtr::NONE;
            h.time = now;
            h.exptime = exptime;
            h.nbytes = nbytes as u32;
            h.flags = flags;
            h.refcount = 1;
            h.it_flags = ITEM_VALID;
            h.nkey = nkey as u8;
        }

        let mut prev = title;
        for _ in 1..needed {
            let c = match tier {
                Tier::Large => {
                    let c = self.pop_large().expect("replenished large list empty");
                    self.set_flags(c, CHUNK_INITIALIZED | CHUNK_USED);
                    c
                }
                Tier::Small => self.pop_small().expect("replenished small list empty"),
            };
            self.set_next_chunk_of(c, ChunkPtr::NONE);
            if tier == Tier::Small {
                self.set_body_prev(c, prev);
            }
            self.set_next_chunk_of(prev, c);
            prev = c;
        }

        self.memcpy_to(title, 0, key, false);

        // Stamp whatever fits into the slack after the value.
        let payload = nkey + nbytes;
        let slack = chain_capacity(needed, tier) - payload;
        if slack >= STAMP_TIMESTAMP_SZ {
            let abs_time = self.started.wrapping_add(self.current_time);
            self.memcpy_to(title, payload, &abs_time.to_ne_bytes(), true);
            self.hdr_mut(title).it_flags |= ITEM_HAS_TIMESTAMP;
            if slack >= STAMP_TIMESTAMP_SZ + STAMP_IP_SZ {
                self.memcpy_to(title, payload + STAMP_TIMESTAMP_SZ, &ip.octets(), true);
                self.hdr_mut(title).it_flags |= ITEM_HAS_IP_ADDRESS;
            }
        }

        Some(title)
    }

    /// Drive the tier's free list up to `needed` entries.  Returns false
    /// only when a whole strategy pass produced no movement on either
    /// free list.
    fn replenish(&mut self, tier: Tier, needed: usize) -> bool {
        const SPL: usize = SMALL_CHUNKS_PER_LARGE_CHUNK;
        loop {
            let satisfied = match tier {
                Tier::Large => self.large_free_sz >= needed,
                Tier::Small => self.small_free_sz >= needed,
            };
            if satisfied {
                return true;
            }

            let snapshot = (self.large_free_sz, self.small_free_sz);
            match tier {
                Tier::Large => {
                    self.grow();
                    if self.large_free_sz < needed
                        && self.large_free_sz * SPL + self.small_free_sz >= needed * SPL
                    {
                        self.coalesce();
                    }
                    if self.large_free_sz < needed {
                        self.lru_evict(tier, needed);
                    }
                }
                Tier::Small => {
                    if self.small_free_sz < needed && self.large_free_sz > 0 {
                        if let Some(lc) = self.pop_large() {
                            self.break_chunk(lc);
                        }
                    }
                    if self.small_free_sz < needed {
                        self.grow();
                    }
                    if self.small_free_sz < needed {
                        self.lru_evict(tier, needed);
                    }
                }
            }
            if (self.large_free_sz, self.small_free_sz) == snapshot {
                return false;
            }
        }
    }

    /// Evict LRU-tail items until the tier's demand is satisfiable, or no
    /// reclaimable victim remains within the search depth.
    pub(crate) fn lru_evict(&mut self, tier: Tier, needed: usize) -> bool {
        const SPL: usize = SMALL_CHUNKS_PER_LARGE_CHUNK;
        loop {
            match tier {
                Tier::Small => {
                    // Large free chunks count: they can be broken on demand.
                    if self.large_free_sz * SPL + self.small_free_sz >= needed {
                        return true;
                    }
                }
                Tier::Large => {
                    if self.large_free_sz >= needed {
                        return true;
                    }
                    if self.large_free_sz * SPL + self.small_free_sz >= needed * SPL {
                        self.coalesce();
                        if self.large_free_sz >= needed {
                            return true;
                        }
                    }
                }
            }

            let victim = match self.get_lru_item() {
                Some(v) => v,
                None => return false,
            };
            self.unlink(victim, UnlinkCause::MaybeEvict, None);
        }
    }
}
