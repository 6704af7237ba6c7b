// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Flat storage engine.
//!
//! The engine carves a single mmap'd arena into 1 KiB large chunks, breaks
//! some of them into 120-byte small chunks, and composes multi-chunk items
//! threaded onto two LRUs (small/large) and a chained hash index. All
//! state lives in one [`FlatStorage`] context; the server wraps it in a
//! mutex (the cache lock) and every public operation runs under it.
//!
//! Submodules carve the implementation by concern:
//! - [`chunk`]: data model, handles, size arithmetic
//! - [`arena`]: the mmap'd region and lazy initialization
//! - [`table`]: chunk state table and item data accessors
//! - [`freelist`]: free lists, break/unbreak
//! - [`lru`]: LRU queues and victim search
//! - [`assoc`]: hash index
//! - [`eviction`]: LRU eviction and small-chunk coalescing
//! - [`items`]: item lifecycle and command-level operations

pub mod arena;
pub mod assoc;
pub mod chunk;
pub mod eviction;
pub mod freelist;
pub mod items;
pub mod lru;
pub mod table;

use serde::Serialize;

use crate::core::error::Result;
use crate::core::time::RelTime;
use crate::storage::arena::DEFAULT_GROW_DELTA;
use crate::storage::assoc::HashIndex;
use crate::storage::chunk::{ChunkPtr, ItemPtr, SMALL_CHUNKS_PER_LARGE_CHUNK};
use crate::storage::lru::LruList;
use crate::storage::table::ChunkTable;

/// Why an item is being unlinked; classifies the eviction/expiry stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkReason {
    /// Explicit removal (delete, replace).
    Normal,
    /// Reclaimed by the allocator; classified into evict/expired by
    /// comparing the item's exptime against the current time.
    MaybeEvict,
    /// Known eviction.
    IsEvict,
    /// Known expiration.
    IsExpired,
}

/// Outcome of one coalescing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceProgress {
    /// Nothing freed and no migratable parent found.
    NoProgress,
    /// Chunks were freed but no whole large chunk was recovered.
    ForwardProgress,
    /// A large free chunk was produced.
    LargeChunkFormed,
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Arena cap in bytes; multiple of the chunk size and of `grow_delta`.
    pub maxbytes: usize,
    /// Bytes initialized per arena growth step.
    pub grow_delta: usize,
    /// Evict on exhaustion instead of failing the allocation.
    pub evict_to_free: bool,
    /// log2 of the initial hash bucket count.
    pub hash_power: u8,
}

impl StorageConfig {
    pub fn new(maxbytes: usize) -> Self {
        StorageConfig {
            maxbytes,
            grow_delta: DEFAULT_GROW_DELTA.min(maxbytes),
            evict_to_free: true,
            hash_power: 16,
        }
    }
}

/// Storage-engine counters, reported through the stats command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlatStats {
    pub large_title_chunks: u64,
    pub large_body_chunks: u64,
    pub large_broken_chunks: u64,
    pub small_title_chunks: u64,
    pub small_body_chunks: u64,
    /// Broken parents bucketed by allocated small-chunk count.
    pub broken_chunk_histogram: [u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],
    pub break_events: u64,
    pub unbreak_events: u64,
    pub migrates: u64,
    /// Bytes the arena has initialized into chunks.
    pub storage_allocated: u64,
    pub curr_items: u64,
    pub total_items: u64,
    /// Sum of nkey+nbytes over linked items.
    pub item_total_size: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// A delete whose reclamation is parked until its lock window elapses.
/// The queue owns one reference to the item.
#[derive(Debug, Clone, Copy)]
pub struct DeferredDelete {
    pub item: ItemPtr,
    pub deadline: RelTime,
}

/// The flat storage engine context.
pub struct FlatStorage {
    pub(crate) table: ChunkTable,
    pub(crate) large_free_head: Option<ChunkPtr>,
    pub(crate) large_free_count: usize,
    pub(crate) small_free_head: Option<ChunkPtr>,
    pub(crate) small_free_count: usize,
    pub(crate) large_lru: LruList,
    pub(crate) small_lru: LruList,
    pub(crate) index: HashIndex,
    pub stats: FlatStats,
    /// Items last accessed at or before this instant are flushed.
    pub(crate) oldest_live: RelTime,
    pub(crate) deferred: Vec<DeferredDelete>,
    pub(crate) evict_to_free: bool,
}

impl FlatStorage {
    /// Initialize the engine: reserve the arena and run the first growth
    /// step so the large free list starts non-empty.
    pub fn new(config: StorageConfig) -> Result<Self> {
        let mut storage = FlatStorage {
            table: ChunkTable::new(config.maxbytes, config.grow_delta)?,
            large_free_head: None,
            large_free_count: 0,
            small_free_head: None,
            small_free_count: 0,
            large_lru: LruList::default(),
            small_lru: LruList::default(),
            index: HashIndex::new(config.hash_power),
            stats: FlatStats::default(),
            oldest_live: 0,
            deferred: Vec::new(),
            evict_to_free: config.evict_to_free,
        };

        let grew = storage.arena_grow();
        assert!(grew && storage.large_free_count > 0, "initial arena growth failed");
        Ok(storage)
    }

    /// Chunk table accessor for read paths (key/value extraction, tests).
    #[inline]
    pub fn table(&self) -> &ChunkTable {
        &self.table
    }

    #[inline]
    pub fn large_free_count(&self) -> usize {
        self.large_free_count
    }

    #[inline]
    pub fn small_free_count(&self) -> usize {
        self.small_free_count
    }

    #[inline]
    pub fn curr_items(&self) -> u64 {
        self.stats.curr_items
    }

    #[inline]
    pub fn oldest_live(&self) -> RelTime {
        self.oldest_live
    }

    /// Base pointer of the arena, for the zero-copy send path.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.table.base_ptr()
    }

    /// Incremental hash-table migration; one bucket per call.
    pub fn move_next_bucket(&mut self) {
        self.index.move_next_bucket(&mut self.table);
    }

    /// Head (newest item) of a flavor's LRU; diagnostics and tests.
    pub fn lru_head(&self, kind: chunk::ChunkKind) -> Option<ItemPtr> {
        self.lru(kind).head
    }

    /// Items currently linked in the index.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }
}

impl std::fmt::Debug for FlatStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatStorage")
            .field("large_free", &self.large_free_count)
            .field("small_free", &self.small_free_count)
            .field("curr_items", &self.stats.curr_items)
            .field("oldest_live", &self.oldest_live)
            .finish()
    }
}

pub use chunk::{ChunkKind, ItemFlags};
pub use items::StoreMode;
