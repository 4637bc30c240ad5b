// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Monotonic and gauge counters maintained by the engine.  Everything here
// is mutated under the caller's cache lock; publication to any wire format
// happens through the text surfaces in dump.rs.

use std::collections::HashMap;

use crate::storage::FlatStorage;

/// Engine-wide counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    /// Large chunks broken into small chunks, cumulative.
    pub break_events: u64,
    /// Broken chunks restored to whole large chunks, cumulative.
    pub unbreak_events: u64,
    /// Small chunks physically relocated by the coalescer, cumulative.
    pub migrates: u64,
    /// Items currently linked.
    pub curr_items: u64,
    /// Items ever linked, cumulative.
    pub total_items: u64,
    /// Payload bytes (key + value) of currently linked items.
    pub curr_bytes: u64,
    /// Items unlinked by the eviction driver before their expiry.
    pub evictions: u64,
    /// Items unlinked because their expiry (or a flush) had passed.
    pub expirations: u64,
}

/// Separator between a key's detail prefix and the rest of the key.
/// Keys without it are not attributed to any prefix.
pub const PREFIX_DELIMITER: u8 = b':';

/// Per-prefix removal counters, maintained by `unlink` while
/// `Settings::detail_enabled` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrefixRemovals {
    /// Items unlinked under this prefix.
    pub items: u64,
    /// Payload bytes (key + value) those items carried.
    pub bytes: u64,
}

impl FlatStorage {
    /// Attribute one removal of `bytes` payload bytes to `key`'s prefix.
    pub(crate) fn record_prefix_removal(&mut self, key: &[u8], bytes: usize) {
        let pos = match key.iter().position(|&b| b == PREFIX_DELIMITER) {
            Some(pos) if pos > 0 => pos,
            _ => return,
        };
        let entry = self
            .prefix_removals
            .entry(key[..pos].to_vec())
            .or_default();
        entry.items += 1;
        entry.bytes += bytes as u64;
    }

    /// Per-prefix removal counters gathered so far.  Empty unless
    /// `settings.detail_enabled` was set while items were unlinked.
    pub fn prefix_stats(&self) -> &HashMap<Vec<u8>, PrefixRemovals> {
        &self.prefix_removals
    }
}
