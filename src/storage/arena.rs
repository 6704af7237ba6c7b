// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Page arena backing the flat storage engine.
//!
//! One anonymous memory map holds every chunk payload. The full cap is
//! reserved up front but initialized lazily: [`PageArena::grow`] advances
//! the initialized frontier one increment at a time, so resident size
//! tracks cache warmth instead of the configured cap. The arena never
//! returns memory to the OS; eviction recycles chunks in place.
//!
//! Anonymous maps are page-aligned, so large-chunk alignment holds
//! without over-allocating.

use memmap2::MmapMut;

use crate::core::error::{CacheError, Result};
use crate::storage::chunk::LARGE_CHUNK_SIZE;

/// Default growth step: 2048 large chunks per [`PageArena::grow`] call.
pub const DEFAULT_GROW_DELTA: usize = LARGE_CHUNK_SIZE * 2048;

/// The mmap'd storage region and its initialization frontier.
pub struct PageArena {
    map: MmapMut,
    /// Bytes not yet initialized into chunks.
    unused_bytes: usize,
    /// Large chunks initialized so far; also the frontier index.
    initialized_chunks: usize,
    /// Bytes initialized per grow() call.
    grow_delta: usize,
    total_bytes: usize,
}

impl PageArena {
    /// Reserve an arena of `total` bytes, growing in `grow_delta` steps.
    ///
    /// `total` must be a nonzero multiple of both the large chunk size and
    /// `grow_delta`. Fails with `OutOfAddressSpace` only if the map cannot
    /// be reserved.
    pub fn new(total: usize, grow_delta: usize) -> Result<Self> {
        if total == 0
            || total % LARGE_CHUNK_SIZE != 0
            || grow_delta == 0
            || grow_delta % LARGE_CHUNK_SIZE != 0
            || total % grow_delta != 0
        {
            return Err(CacheError::invariant_violation(format!(
                "arena size {total} / growth delta {grow_delta} must be multiples of {LARGE_CHUNK_SIZE}"
            )));
        }

        let map = MmapMut::map_anon(total)
            .map_err(|e| CacheError::out_of_address_space(total, e.to_string()))?;

        Ok(PageArena {
            map,
            unused_bytes: total,
            initialized_chunks: 0,
            grow_delta,
            total_bytes: total,
        })
    }

    /// Initialize one more increment of large chunks.
    ///
    /// Returns the range of newly initialized large-chunk indices, or
    /// `None` when the remaining unused region is smaller than the delta.
    pub fn grow(&mut self) -> Option<std::ops::Range<usize>> {
        if self.grow_delta > self.unused_bytes {
            return None;
        }

        let first = self.initialized_chunks;
        let added = self.grow_delta / LARGE_CHUNK_SIZE;
        self.initialized_chunks += added;
        self.unused_bytes -= self.grow_delta;
        Some(first..first + added)
    }

    /// Large chunks initialized so far.
    #[inline]
    pub fn initialized_chunks(&self) -> usize {
        self.initialized_chunks
    }

    /// Bytes not yet initialized.
    #[inline]
    pub fn unused_bytes(&self) -> usize {
        self.unused_bytes
    }

    /// Configured cap in bytes.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Base pointer of the storage region.
    ///
    /// Stable for the arena's lifetime; the map is never remapped or
    /// resized after construction.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Borrow a payload byte range.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.initialized_chunks * LARGE_CHUNK_SIZE);
        &self.map[offset..offset + len]
    }

    /// Mutably borrow a payload byte range.
    #[inline]
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.initialized_chunks * LARGE_CHUNK_SIZE);
        &mut self.map[offset..offset + len]
    }
}

impl std::fmt::Debug for PageArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageArena")
            .field("total_bytes", &self.total_bytes)
            .field("unused_bytes", &self.unused_bytes)
            .field("initialized_chunks", &self.initialized_chunks)
            .finish()
    }
}
