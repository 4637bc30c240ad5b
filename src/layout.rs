// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Compile-time layout of the flat storage region.
//
// The region is an array of large chunks; a large chunk may be broken into
// an array of small chunks.  Chunks refer to each other by compact index
// (`ChunkPtr`), never by address, so the whole engine can be moved or
// snapshotted and intra-region links stay valid.
//
// In-region layout per chunk kind:
//
//   title chunk  : [ ItemHeader ][ data … ]
//   body  chunk  : [ SmallBodyHeader | LargeBodyHeader ][ data … ]
//   free  chunk  : [ FreeHeader ][ garbage … ]
//
// Per-chunk state flags, per-parent allocated counts and the occupancy
// histogram live in engine-side tables indexed by chunk position.

/// Size of a large chunk in bytes.
pub const LARGE_CHUNK_SZ: usize = 1024;

/// Size of a small chunk carved out of a broken large chunk.
pub const SMALL_CHUNK_SZ: usize = 128;

/// Small chunks per broken large chunk.
pub const SMALL_CHUNKS_PER_LARGE_CHUNK: usize = LARGE_CHUNK_SZ / SMALL_CHUNK_SZ;

/// Lazy-initialisation quantum: `grow()` brings this many bytes of the
/// region online at a time.
pub const INCREMENT_DELTA: usize = 8192;

/// Longest accepted key.
pub const KEY_MAX_LENGTH: usize = 250;

/// Largest accepted value.
pub const MAX_ITEM_SIZE: usize = 1 << 20;

/// An item younger than this (seconds) is not re-ordered by `update`.
pub const UPDATE_INTERVAL: u32 = 60;

/// How many LRU-tail items the eviction driver inspects per victim search.
pub const LRU_SEARCH_DEPTH: usize = 50;

/// Bytes of the optional tail-slack timestamp stamp.
pub const STAMP_TIMESTAMP_SZ: usize = 4;

/// Bytes of the optional tail-slack IPv4 stamp.
pub const STAMP_IP_SZ: usize = 4;

const _: () = assert!(LARGE_CHUNK_SZ % SMALL_CHUNK_SZ == 0);
const _: () = assert!(SMALL_CHUNKS_PER_LARGE_CHUNK >= 2);
const _: () = assert!(INCREMENT_DELTA % LARGE_CHUNK_SZ == 0);
const _: () = assert!(SMALL_CHUNKS_PER_LARGE_CHUNK.is_power_of_two());

// ---------------------------------------------------------------------------
// ChunkPtr — compact chunk identifier
// ---------------------------------------------------------------------------

/// Compact identifier of a chunk: the index of a large chunk, or a tagged
/// `(parent, slot)` pair for a small chunk.  `ChunkPtr::NONE` is the
/// reserved "no chunk" sentinel.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ChunkPtr(u32);

/// An item is addressed by the chunk pointer of its title chunk.
pub type ItemHandle = ChunkPtr;

const SMALL_TAG: u32 = 1 << 31;
const SLOT_BITS: u32 = SMALL_CHUNKS_PER_LARGE_CHUNK.trailing_zeros();
const SLOT_MASK: u32 = SMALL_CHUNKS_PER_LARGE_CHUNK as u32 - 1;

impl ChunkPtr {
    /// The "no chunk" sentinel.
    pub const NONE: ChunkPtr = ChunkPtr(u32::MAX);

    /// Pointer to the large chunk at `index`.
    #[inline]
    pub fn large(index: u32) -> ChunkPtr {
        debug_assert!(index & SMALL_TAG == 0);
        ChunkPtr(index)
    }

    /// Pointer to small chunk `slot` of broken large chunk `parent`.
    #[inline]
    pub fn small(parent: u32, slot: u32) -> ChunkPtr {
        debug_assert!(slot < SMALL_CHUNKS_PER_LARGE_CHUNK as u32);
        debug_assert!(parent < (SMALL_TAG >> SLOT_BITS));
        ChunkPtr(SMALL_TAG | (parent << SLOT_BITS) | slot)
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == ChunkPtr::NONE
    }

    #[inline]
    pub fn is_small(self) -> bool {
        !self.is_none() && self.0 & SMALL_TAG != 0
    }

    #[inline]
    pub fn is_large(self) -> bool {
        !self.is_none() && self.0 & SMALL_TAG == 0
    }

    /// Index of this large chunk.
    #[inline]
    pub fn large_index(self) -> u32 {
        debug_assert!(self.is_large());
        self.0
    }

    /// Index of the broken large chunk this small chunk lives in.
    #[inline]
    pub fn parent(self) -> u32 {
        debug_assert!(self.is_small());
        (self.0 & !SMALL_TAG) >> SLOT_BITS
    }

    /// Slot of this small chunk within its parent.
    #[inline]
    pub fn slot(self) -> u32 {
        debug_assert!(self.is_small());
        self.0 & SLOT_MASK
    }

    /// The tier this chunk belongs to.
    #[inline]
    pub fn tier(self) -> Tier {
        if self.is_small() {
            Tier::Small
        } else {
            Tier::Large
        }
    }
}

impl core::fmt::Debug for ChunkPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_none() {
            write!(f, "ChunkPtr::NONE")
        } else if self.is_small() {
            write!(f, "ChunkPtr::small({}, {})", self.parent(), self.slot())
        } else {
            write!(f, "ChunkPtr::large({})", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// Allocation tier of an item: every chunk of an item is of the same tier.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
    Small,
    Large,
}

impl Tier {
    /// Payload bytes held by a title chunk of this tier.
    #[inline]
    pub const fn title_data_sz(self) -> usize {
        match self {
            Tier::Small => SMALL_TITLE_DATA_SZ,
            Tier::Large => LARGE_TITLE_DATA_SZ,
        }
    }

    /// Payload bytes held by a body chunk of this tier.
    #[inline]
    pub const fn body_data_sz(self) -> usize {
        match self {
            Tier::Small => SMALL_BODY_DATA_SZ,
            Tier::Large => LARGE_BODY_DATA_SZ,
        }
    }

    /// Total chunk size of this tier.
    #[inline]
    pub const fn chunk_sz(self) -> usize {
        match self {
            Tier::Small => SMALL_CHUNK_SZ,
            Tier::Large => LARGE_CHUNK_SZ,
        }
    }
}

// ---------------------------------------------------------------------------
// In-region headers
// ---------------------------------------------------------------------------

/// Header at the start of every title chunk.  The payload
/// (`key ‖ value ‖ stamps`) begins immediately after.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ItemHeader {
    /// LRU link toward the tail (next-older title), or NONE.
    pub next: ChunkPtr,
    /// LRU link toward the head (next-newer title), or NONE.
    pub prev: ChunkPtr,
    /// Reserved for the external index's chaining; NONE while unlinked.
    pub h_next: ChunkPtr,
    /// First body chunk of the chain, or NONE for single-chunk items.
    pub next_chunk: ChunkPtr,
    /// Last-touch time, in engine clock seconds.
    pub time: u32,
    /// Expiry time (0 = never).  Doubles as the delete-lock deadline while
    /// `ITEM_DELETED` is set.
    pub exptime: u32,
    /// Value length in bytes.
    pub nbytes: u32,
    /// Opaque caller flags, stored verbatim.
    pub flags: u32,
    /// Outstanding external holders.  Only items at zero may be reclaimed.
    pub refcount: u16,
    /// ITEM_* flag word.
    pub it_flags: u8,
    /// Key length in bytes.
    pub nkey: u8,
}

/// Header of a small body chunk.  Small bodies are doubly linked so the
/// coalescer can reach a migrated chunk's neighbours in O(1).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SmallBodyHeader {
    pub prev_chunk: ChunkPtr,
    pub next_chunk: ChunkPtr,
}

/// Header of a large body chunk.  Large chunks are never migrated, so no
/// back link is needed; the predecessor is found by walking from the title.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LargeBodyHeader {
    pub next_chunk: ChunkPtr,
}

/// Free-list links, overlaid on the data area of a free chunk.  The large
/// list uses only `next`; the small list also threads `prev_next`, the
/// pointer of the *previous node whose `next` names this chunk* (NONE means
/// the list-head slot itself), which makes mid-list unlink O(1).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FreeHeader {
    pub next: ChunkPtr,
    pub prev_next: ChunkPtr,
}

/// Size of the title-chunk header.
pub const ITEM_HEADER_SZ: usize = core::mem::size_of::<ItemHeader>();

/// Payload capacity of a large title chunk.
pub const LARGE_TITLE_DATA_SZ: usize = LARGE_CHUNK_SZ - ITEM_HEADER_SZ;

/// Payload capacity of a large body chunk.
pub const LARGE_BODY_DATA_SZ: usize = LARGE_CHUNK_SZ - core::mem::size_of::<LargeBodyHeader>();

/// Payload capacity of a small title chunk.
pub const SMALL_TITLE_DATA_SZ: usize = SMALL_CHUNK_SZ - ITEM_HEADER_SZ;

/// Payload capacity of a small body chunk.
pub const SMALL_BODY_DATA_SZ: usize = SMALL_CHUNK_SZ - core::mem::size_of::<SmallBodyHeader>();

/// Largest `nkey + nbytes` an item can carry without leaving the small
/// tier: a small item never spans more than one parent's worth of chunks.
pub const SMALL_ITEM_MAX_PAYLOAD: usize =
    SMALL_TITLE_DATA_SZ + (SMALL_CHUNKS_PER_LARGE_CHUNK - 1) * SMALL_BODY_DATA_SZ;

const _: () = assert!(ITEM_HEADER_SZ == 36);
const _: () = assert!(ITEM_HEADER_SZ + 2 * STAMP_TIMESTAMP_SZ <= SMALL_CHUNK_SZ);
const _: () = assert!(KEY_MAX_LENGTH <= u8::MAX as usize);
const _: () = assert!(SMALL_ITEM_MAX_PAYLOAD < LARGE_TITLE_DATA_SZ + LARGE_BODY_DATA_SZ);

// ---------------------------------------------------------------------------
// Chunk state flags (engine-side tables)
// ---------------------------------------------------------------------------

/// Chunk has been brought online by `grow()`; never cleared.
pub const CHUNK_INITIALIZED: u8 = 0x01;
/// Chunk sits on its tier's free list.  Exclusive with `CHUNK_USED`.
pub const CHUNK_FREE: u8 = 0x02;
/// Chunk backs an item (or, for a large chunk, is broken).
pub const CHUNK_USED: u8 = 0x04;
/// Large chunk subdivided into small chunks.  Implies `CHUNK_USED`.
pub const CHUNK_BROKEN: u8 = 0x08;
/// First chunk of an item; the `ItemHeader` lives here.
pub const CHUNK_TITLE: u8 = 0x10;
/// Small chunk withdrawn from circulation mid-coalesce.
pub const CHUNK_COALESCE_PENDING: u8 = 0x20;

// ---------------------------------------------------------------------------
// Item flags
// ---------------------------------------------------------------------------

/// Header fully stamped by `alloc`.
pub const ITEM_VALID: u8 = 0x01;
/// Item is in the LRU and the external index.
pub const ITEM_LINKED: u8 = 0x02;
/// Item is delete-locked; `exptime` holds the lock deadline.
pub const ITEM_DELETED: u8 = 0x04;
/// A 4-byte timestamp is stamped into tail slack after the value.
pub const ITEM_HAS_TIMESTAMP: u8 = 0x08;
/// A 4-byte IPv4 address follows the timestamp stamp.
pub const ITEM_HAS_IP_ADDRESS: u8 = 0x10;

// ---------------------------------------------------------------------------
// Tier selection
// ---------------------------------------------------------------------------

/// Whether an item of this shape must live in the large tier.
///
/// A pure function of its inputs and the layout constants: items that fit
/// one parent's worth of small chunks stay small, everything else is large.
#[inline]
pub fn is_large_chunk(nkey: usize, nbytes: usize) -> bool {
    nkey + nbytes > SMALL_ITEM_MAX_PAYLOAD
}

/// Chunks required to store `nkey + nbytes` payload bytes in `tier`.
#[inline]
pub fn chunks_needed(nkey: usize, nbytes: usize, tier: Tier) -> usize {
    let payload = nkey + nbytes;
    let title = tier.title_data_sz();
    if payload <= title {
        return 1;
    }
    let body = tier.body_data_sz();
    1 + (payload - title + body - 1) / body
}

/// Total payload capacity of an item spanning `nchunks` chunks of `tier`.
#[inline]
pub fn chain_capacity(nchunks: usize, tier: Tier) -> usize {
    tier.title_data_sz() + (nchunks - 1) * tier.body_data_sz()
}
