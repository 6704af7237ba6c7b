// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Chunk table: the arena bytes plus the side table of chunk states.
//!
//! Every structural accessor of the storage engine lives here: title
//! header lookup, chunk chain traversal, and the segment walk that maps an
//! item's logical byte range onto arena byte ranges. An item's logical
//! data space starts with the key at offset 0, followed by the value at
//! offset `nkey`, laid across its title chunk and body chunks in order.
//!
//! # Pinning rule
//!
//! Segment offsets returned by [`ChunkTable::walk`] remain valid while the
//! item's refcount is held: eviction skips referenced items and coalescing
//! refuses to migrate chunks of referenced parents, so a referenced item's
//! bytes never move. The zero-copy send path relies on this to build
//! iovecs from `base_ptr() + offset` without holding the cache lock.

use std::net::Ipv4Addr;

use crate::core::error::Result;
use crate::core::time::RelTime;
use crate::storage::arena::PageArena;
use crate::storage::chunk::{
    chunks_needed, ChunkKind, ChunkPtr, ItemFlags, ItemPtr, LargeChunk, SmallChunk, TitleHeader,
    LARGE_BODY_DATA_SIZE, LARGE_TITLE_DATA_SIZE, SMALL_BODY_DATA_SIZE, SMALL_TITLE_DATA_SIZE,
};

/// One contiguous piece of an item's data, as arena byte coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

/// Arena payload plus per-chunk state.
pub struct ChunkTable {
    arena: PageArena,
    chunks: Vec<LargeChunk>,
}

impl ChunkTable {
    pub fn new(total: usize, grow_delta: usize) -> Result<Self> {
        Ok(ChunkTable {
            arena: PageArena::new(total, grow_delta)?,
            chunks: Vec::new(),
        })
    }

    /// Grow the arena; new chunks enter the table detached (not yet on a
    /// free list). Returns the range of new large-chunk indices.
    pub fn grow(&mut self) -> Option<std::ops::Range<usize>> {
        let range = self.arena.grow()?;
        self.chunks
            .resize(range.end, LargeChunk::Free { next: None });
        Some(range)
    }

    #[inline]
    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    #[inline]
    pub fn initialized_chunks(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.arena.base_ptr()
    }

    #[inline]
    pub fn large(&self, index: usize) -> &LargeChunk {
        &self.chunks[index]
    }

    #[inline]
    pub fn large_mut(&mut self, index: usize) -> &mut LargeChunk {
        &mut self.chunks[index]
    }

    /// Access a small chunk; the parent must be broken.
    pub fn small(&self, ptr: ChunkPtr) -> &SmallChunk {
        match &self.chunks[ptr.large_index()] {
            LargeChunk::Broken(broken) => &broken.small[ptr.small_index()],
            other => panic!(
                "chunk {} is not broken (state {:?})",
                ptr.large_index(),
                std::mem::discriminant(other)
            ),
        }
    }

    /// Mutably access a small chunk; the parent must be broken.
    pub fn small_mut(&mut self, ptr: ChunkPtr) -> &mut SmallChunk {
        match &mut self.chunks[ptr.large_index()] {
            LargeChunk::Broken(broken) => &mut broken.small[ptr.small_index()],
            _ => panic!("chunk {} is not broken", ptr.large_index()),
        }
    }

    /// Whether this item's title lives in a small chunk.
    pub fn is_small_item(&self, it: ItemPtr) -> bool {
        matches!(self.chunks[it.large_index()], LargeChunk::Broken(_))
    }

    /// Storage flavor of an item.
    #[inline]
    pub fn item_kind(&self, it: ItemPtr) -> ChunkKind {
        if self.is_small_item(it) {
            ChunkKind::Small
        } else {
            ChunkKind::Large
        }
    }

    /// The item header behind a title chunk handle.
    pub fn title(&self, it: ItemPtr) -> &TitleHeader {
        match &self.chunks[it.large_index()] {
            LargeChunk::Title(header) => {
                debug_assert_eq!(it.small_index(), 0);
                header
            }
            LargeChunk::Broken(broken) => match &broken.small[it.small_index()] {
                SmallChunk::Title(header) => header,
                other => panic!("small chunk {:?} is not a title: {other:?}", it),
            },
            other => panic!("chunk {:?} is not a title: {:?}", it, std::mem::discriminant(other)),
        }
    }

    /// Mutable item header access.
    pub fn title_mut(&mut self, it: ItemPtr) -> &mut TitleHeader {
        match &mut self.chunks[it.large_index()] {
            LargeChunk::Title(header) => header,
            LargeChunk::Broken(broken) => match &mut broken.small[it.small_index()] {
                SmallChunk::Title(header) => header,
                _ => panic!("small chunk {:?} is not a title", it),
            },
            _ => panic!("chunk {:?} is not a title", it),
        }
    }

    /// Next chunk after `ptr` along an item chain, if any.
    pub fn next_in_chain(&self, ptr: ChunkPtr) -> Option<ChunkPtr> {
        match &self.chunks[ptr.large_index()] {
            LargeChunk::Title(header) => header.next_chunk,
            LargeChunk::Body { next_chunk } => *next_chunk,
            LargeChunk::Broken(broken) => match &broken.small[ptr.small_index()] {
                SmallChunk::Title(header) => header.next_chunk,
                SmallChunk::Body { next_chunk, .. } => *next_chunk,
                other => panic!("chunk {:?} is not in a chain: {other:?}", ptr),
            },
            LargeChunk::Free { .. } => panic!("free chunk {:?} has no chain", ptr),
        }
    }

    /// Every chunk of an item, title first.
    pub fn chunk_chain(&self, it: ItemPtr) -> Vec<ChunkPtr> {
        let header = self.title(it);
        let expected = chunks_needed(header.nkey as usize, header.nbytes as usize);
        let mut chain = Vec::with_capacity(expected);
        let mut cursor = Some(it);
        while let Some(ptr) = cursor {
            chain.push(ptr);
            cursor = self.next_in_chain(ptr);
        }
        debug_assert_eq!(chain.len(), expected);
        chain
    }

    /// Per-chunk data capacities for an item's flavor: (title, body).
    fn capacities(&self, it: ItemPtr) -> (usize, usize) {
        if self.is_small_item(it) {
            (SMALL_TITLE_DATA_SIZE, SMALL_BODY_DATA_SIZE)
        } else {
            (LARGE_TITLE_DATA_SIZE, LARGE_BODY_DATA_SIZE)
        }
    }

    /// Map the item's logical byte range `[offset, offset+len)` onto arena
    /// segments. With `beyond_item_boundary` the range may extend into the
    /// slack of the last chunk (used by stamping), never past it.
    pub fn walk(&self, it: ItemPtr, offset: usize, len: usize, beyond_item_boundary: bool) -> Vec<Segment> {
        let header = self.title(it);
        let (title_cap, body_cap) = self.capacities(it);
        let item_bytes = header.nkey as usize + header.nbytes as usize;
        let nchunks = chunks_needed(header.nkey as usize, header.nbytes as usize);
        let chain_cap = title_cap + body_cap * (nchunks - 1);

        let bound = if beyond_item_boundary { chain_cap } else { item_bytes };
        debug_assert!(offset + len <= bound, "walk out of bounds: {}+{} > {bound}", offset, len);

        let mut segments = Vec::new();
        let mut logical_start = 0usize; // logical offset where the current chunk begins
        let mut cursor = Some(it);
        let mut first = true;

        while let Some(ptr) = cursor {
            let cap = if first { title_cap } else { body_cap };
            let chunk_end = logical_start + cap;

            let want_start = offset.max(logical_start);
            let want_end = (offset + len).min(chunk_end);
            if want_start < want_end {
                segments.push(Segment {
                    offset: ptr.byte_offset() + (want_start - logical_start),
                    len: want_end - want_start,
                });
            }
            if chunk_end >= offset + len {
                break;
            }

            logical_start = chunk_end;
            cursor = self.next_in_chain(ptr);
            first = false;
        }

        segments
    }

    /// Copy bytes into an item's logical range.
    pub fn copy_to_item(&mut self, it: ItemPtr, offset: usize, src: &[u8], beyond_item_boundary: bool) {
        let segments = self.walk(it, offset, src.len(), beyond_item_boundary);
        let mut cursor = 0;
        for seg in segments {
            self.arena
                .slice_mut(seg.offset, seg.len)
                .copy_from_slice(&src[cursor..cursor + seg.len]);
            cursor += seg.len;
        }
        debug_assert_eq!(cursor, src.len());
    }

    /// Copy bytes out of an item's logical range.
    pub fn copy_from_item(&self, it: ItemPtr, offset: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for seg in self.walk(it, offset, len, false) {
            out.extend_from_slice(self.arena.slice(seg.offset, seg.len));
        }
        debug_assert_eq!(out.len(), len);
        out
    }

    /// Compare an item's key with `key`, length first, then bytes.
    pub fn key_eq(&self, it: ItemPtr, key: &[u8]) -> bool {
        let header = self.title(it);
        if header.nkey as usize != key.len() {
            return false;
        }
        let mut cursor = 0;
        for seg in self.walk(it, 0, key.len(), false) {
            if self.arena.slice(seg.offset, seg.len) != &key[cursor..cursor + seg.len] {
                return false;
            }
            cursor += seg.len;
        }
        true
    }

    /// Copy out an item's key.
    pub fn key_copy(&self, it: ItemPtr) -> Vec<u8> {
        let nkey = self.title(it).nkey as usize;
        self.copy_from_item(it, 0, nkey)
    }

    /// Unused bytes after the item's data in its chunk chain.
    pub fn slack(&self, it: ItemPtr) -> usize {
        let header = self.title(it);
        let (title_cap, body_cap) = self.capacities(it);
        let nchunks = chunks_needed(header.nkey as usize, header.nbytes as usize);
        let chain_cap = title_cap + body_cap * (nchunks - 1);
        chain_cap - (header.nkey as usize + header.nbytes as usize)
    }

    /// Best-effort stamp of the access time and client address into the
    /// item's trailing slack. Never grows a chunk.
    pub fn stamp(&mut self, it: ItemPtr, now: RelTime, addr: Option<Ipv4Addr>) {
        {
            let header = self.title_mut(it);
            header.it_flags.clear(ItemFlags::HAS_TIMESTAMP);
            header.it_flags.clear(ItemFlags::HAS_IP_ADDRESS);
        }

        let mut slack = self.slack(it);
        let header = *self.title(it);
        let mut offset = header.nkey as usize + header.nbytes as usize;

        if slack >= 4 {
            self.copy_to_item(it, offset, &now.to_le_bytes(), true);
            self.title_mut(it).it_flags.set(ItemFlags::HAS_TIMESTAMP);
            slack -= 4;
            offset += 4;
        }

        if let Some(addr) = addr {
            if slack >= 4 {
                self.copy_to_item(it, offset, &addr.octets(), true);
                self.title_mut(it).it_flags.set(ItemFlags::HAS_IP_ADDRESS);
            }
        }
    }

    /// Fill an item's payload range with a poison byte in debug builds
    /// so stale reads are conspicuous.
    pub fn debug_clear(&mut self, segments: &[Segment]) {
        if cfg!(debug_assertions) {
            for seg in segments {
                self.arena.slice_mut(seg.offset, seg.len).fill(0x5a);
            }
        }
    }

    /// Read bytes for a segment.
    #[inline]
    pub fn segment_bytes(&self, seg: Segment) -> &[u8] {
        self.arena.slice(seg.offset, seg.len)
    }

    /// Write bytes for a segment.
    #[inline]
    pub fn segment_bytes_mut(&mut self, seg: Segment) -> &mut [u8] {
        self.arena.slice_mut(seg.offset, seg.len)
    }
}

impl std::fmt::Debug for ChunkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTable")
            .field("initialized_chunks", &self.chunks.len())
            .field("unused_bytes", &self.arena.unused_bytes())
            .finish()
    }
}
