// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// The key→item associative index is an external collaborator: the engine
// only requires a mapping from key bytes to item handles with atomic
// rebinding (used by the coalescer when it physically relocates a title
// chunk).  `HashIndex` is the bundled implementation so the crate works
// stand-alone; a server embedding the engine can substitute its own.

use std::collections::HashMap;

use crate::layout::ItemHandle;

/// Contract between the engine and the key→item index.
///
/// All calls arrive under the caller's cache lock, in program order.  After
/// `update(key, old, new)` returns, a `find(key)` that previously resolved
/// to `old` resolves to `new`; the old handle must never be handed out
/// again.
pub trait AssocIndex {
    fn find(&self, key: &[u8]) -> Option<ItemHandle>;

    fn insert(&mut self, key: &[u8], it: ItemHandle);

    fn delete(&mut self, key: &[u8]);

    /// Atomically rebind `key` from `old` to `new`.  Coalescer-only.
    fn update(&mut self, key: &[u8], old: ItemHandle, new: ItemHandle);

    /// Number of keys currently bound.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-table index over owned key bytes.
#[derive(Default)]
pub struct HashIndex {
    map: HashMap<Box<[u8]>, ItemHandle>,
}

impl HashIndex {
    pub fn new() -> HashIndex {
        HashIndex::default()
    }
}

impl AssocIndex for HashIndex {
    fn find(&self, key: &[u8]) -> Option<ItemHandle> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: &[u8], it: ItemHandle) {
        let prev = self.map.insert(key.into(), it);
        debug_assert!(prev.is_none(), "key inserted twice without delete");
    }

    fn delete(&mut self, key: &[u8]) {
        let prev = self.map.remove(key);
        debug_assert!(prev.is_some(), "delete of unbound key");
    }

    fn update(&mut self, key: &[u8], old: ItemHandle, new: ItemHandle) {
        match self.map.get_mut(key) {
            Some(slot) => {
                debug_assert!(*slot == old, "rebind of a key bound elsewhere");
                *slot = new;
            }
            None => debug_assert!(false, "rebind of unbound key"),
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
