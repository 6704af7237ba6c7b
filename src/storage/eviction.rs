// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Eviction and small-chunk coalescing.
//!
//! When the free lists cannot satisfy an allocation, space is reclaimed by
//! unlinking LRU-tail items, breaking freed large chunks, or migrating the
//! still-used small chunks out of a broken parent so the parent can be
//! unbroken back into one large free chunk.
//!
//! Migration only touches parents none of whose descendants are
//! referenced; this is the dry-run pre-check that keeps the zero-copy
//! pinning rule sound (a referenced item's bytes never move).

use tracing::debug;

use crate::core::time::RelTime;
use crate::storage::chunk::{
    ChunkKind, ChunkPtr, LargeChunk, SmallChunk, SMALL_CHUNKS_PER_LARGE_CHUNK, SMALL_CHUNK_SIZE,
};
use crate::storage::{CoalesceProgress, FlatStorage, UnlinkReason};

impl FlatStorage {
    /// Whether this small chunk belongs to an item with a live reference.
    /// Free and coalesce-pending chunks count as unreferenced.
    fn small_chunk_referenced(&self, ptr: ChunkPtr) -> bool {
        let mut cursor = ptr;
        loop {
            match *self.table.small(cursor) {
                SmallChunk::Free { .. } | SmallChunk::CoalescePending => return false,
                SmallChunk::Title(header) => return header.refcount != 0,
                SmallChunk::Body { prev_chunk, .. } => cursor = prev_chunk,
            }
        }
    }

    /// Whether any child of a broken chunk is referenced.
    fn large_broken_chunk_referenced(&self, index: usize) -> bool {
        (0..SMALL_CHUNKS_PER_LARGE_CHUNK)
            .any(|slot| self.small_chunk_referenced(ChunkPtr::from_parts(index, slot)))
    }

    /// Find a broken parent with no referenced descendants by walking the
    /// small free list. `search_depth` 0 means unbounded.
    fn find_unreferenced_broken_chunk(&self, search_depth: usize) -> Option<usize> {
        let mut cursor = self.small_free_head;
        let mut examined = 0;
        while let Some(ptr) = cursor {
            if search_depth != 0 && examined >= search_depth {
                return None;
            }
            let parent = ptr.large_index();
            if !self.large_broken_chunk_referenced(parent) {
                return Some(parent);
            }
            let SmallChunk::Free { next, .. } = *self.table.small(ptr) else {
                panic!("small free list traversal hit non-free chunk {ptr:?}");
            };
            cursor = next;
            examined += 1;
        }
        None
    }

    /// Coalesce free small chunks into one large free chunk.
    ///
    /// First frees small-LRU tail items (stopping once an item is newer
    /// than `stop_time`) until a parent's worth of small chunks is free;
    /// if an eviction happens to liberate a whole large chunk, returns
    /// `LargeChunkFormed` immediately. Then migrates the used children of
    /// an unreferenced broken parent onto fresh small chunks and unbreaks
    /// the parent.
    pub(crate) fn coalesce_free_small_chunks(
        &mut self,
        stop_time: RelTime,
        now: RelTime,
    ) -> CoalesceProgress {
        let large_pre = self.large_free_count;
        let small_pre = self.small_free_count;

        while self.small_free_count < SMALL_CHUNKS_PER_LARGE_CHUNK {
            let victim = match self.get_lru_item(ChunkKind::Small, None) {
                Some(it) if self.table.title(it).time <= stop_time => it,
                // nothing more to free, or the large LRU is older; the
                // caller should go free that instead
                _ => {
                    return if small_pre == self.small_free_count {
                        CoalesceProgress::NoProgress
                    } else {
                        CoalesceProgress::ForwardProgress
                    };
                }
            };

            debug_assert_eq!(self.table.title(victim).refcount, 0);
            self.do_item_unlink(victim, UnlinkReason::MaybeEvict, now);

            if self.large_free_count > large_pre {
                // the unlink's merge released an entire large chunk
                return CoalesceProgress::LargeChunkFormed;
            }
        }

        let Some(parent) = self.find_unreferenced_broken_chunk(0) else {
            // no migratable parent; report no progress so callers do not
            // spin on us
            return CoalesceProgress::NoProgress;
        };

        let allocated = match self.table.large(parent) {
            LargeChunk::Broken(broken) => broken.allocated as usize,
            _ => unreachable!("find_unreferenced_broken_chunk returned a non-broken parent"),
        };

        // The parent leaves the histogram while its children are in flux;
        // it re-enters at zero just before the unbreak.
        self.stats.broken_chunk_histogram[allocated] -= 1;
        self.stats.migrates += allocated as u64;
        debug!(parent, allocated, "coalescing broken chunk");

        if allocated != 0 {
            // Take the parent's own free children off the free list so we
            // cannot pick them as migration targets.
            for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                let ptr = ChunkPtr::from_parts(parent, slot);
                if matches!(self.table.small(ptr), SmallChunk::Free { .. }) {
                    self.remove_small_from_free_list(ptr);
                }
            }

            for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                let old = ChunkPtr::from_parts(parent, slot);
                let state = *self.table.small(old);
                match state {
                    SmallChunk::CoalescePending => continue,
                    SmallChunk::Free { .. } => unreachable!("free children were delisted"),
                    SmallChunk::Title(_) | SmallChunk::Body { .. } => {}
                }

                let replacement = self
                    .free_list_pop_small()
                    .expect("coalesce ran with a full parent's worth of free chunks");
                self.copy_small_payload(old, replacement);
                *self.table.small_mut(replacement) = state;

                match state {
                    SmallChunk::Title(header) => {
                        // relink LRU neighbors
                        match header.next {
                            Some(next) => self.table.title_mut(next).prev = Some(replacement),
                            None => {
                                debug_assert_eq!(self.small_lru.tail, Some(old));
                                self.small_lru.tail = Some(replacement);
                            }
                        }
                        match header.prev {
                            Some(prev) => self.table.title_mut(prev).next = Some(replacement),
                            None => {
                                debug_assert_eq!(self.small_lru.head, Some(old));
                                self.small_lru.head = Some(replacement);
                            }
                        }
                        // relink the chain successor
                        if let Some(next_chunk) = header.next_chunk {
                            match self.table.small_mut(next_chunk) {
                                SmallChunk::Body { prev_chunk, .. } => *prev_chunk = replacement,
                                other => panic!("chain successor is not a body: {other:?}"),
                            }
                        }
                        // repoint the index entry
                        self.index.update(&mut self.table, old, replacement);
                    }
                    SmallChunk::Body {
                        prev_chunk,
                        next_chunk,
                    } => {
                        match self.table.small_mut(prev_chunk) {
                            SmallChunk::Title(header) => header.next_chunk = Some(replacement),
                            SmallChunk::Body { next_chunk, .. } => *next_chunk = Some(replacement),
                            other => panic!("chain predecessor is not in a chain: {other:?}"),
                        }
                        if let Some(next_chunk) = next_chunk {
                            match self.table.small_mut(next_chunk) {
                                SmallChunk::Body { prev_chunk, .. } => *prev_chunk = replacement,
                                other => panic!("chain successor is not a body: {other:?}"),
                            }
                        }
                    }
                    _ => unreachable!(),
                }

                // keep the vacated slot off the free list so it cannot be
                // handed back out as a migration target
                *self.table.small_mut(old) = SmallChunk::CoalescePending;
                match self.table.large_mut(parent) {
                    LargeChunk::Broken(broken) => broken.allocated -= 1,
                    _ => unreachable!(),
                }
            }
        }

        self.stats.broken_chunk_histogram[0] += 1;
        self.unbreak_large_chunk(parent, true);

        CoalesceProgress::LargeChunkFormed
    }

    /// Reclaim chunks by evicting LRU-tail items until `nchunks` chunks of
    /// the requested flavor are free. Returns false when neither LRU can
    /// yield anything more.
    pub(crate) fn lru_evict(&mut self, kind: ChunkKind, nchunks: usize, now: RelTime) -> bool {
        loop {
            let small_victim = self.get_lru_item(ChunkKind::Small, None);
            let large_victim = self.get_lru_item(ChunkKind::Large, None);

            // pick the older tail; ties go to large, which is simpler to
            // reuse
            let (release_small, release_large) = match (small_victim, large_victim) {
                (None, None) => return false,
                (None, Some(_)) => (false, true),
                (Some(_), None) => (true, false),
                (Some(s), Some(l)) => {
                    if self.table.title(s).time < self.table.title(l).time {
                        (true, false)
                    } else {
                        (false, true)
                    }
                }
            };

            match kind {
                ChunkKind::Small => {
                    if release_small {
                        let victim = small_victim.unwrap();
                        debug_assert_eq!(self.table.title(victim).refcount, 0);
                        self.do_item_unlink(victim, UnlinkReason::MaybeEvict, now);

                        if self.small_free_count
                            + self.large_free_count * SMALL_CHUNKS_PER_LARGE_CHUNK
                            >= nchunks
                        {
                            return true;
                        }
                    }

                    if release_large {
                        let victim = large_victim.unwrap();
                        debug_assert_eq!(self.table.title(victim).refcount, 0);
                        self.do_item_unlink(victim, UnlinkReason::MaybeEvict, now);

                        while self.large_free_count > 0 && self.small_free_count < nchunks {
                            let chunk = self
                                .free_list_pop_large()
                                .expect("large free count said nonzero");
                            self.break_large_chunk(chunk);
                        }
                        if self.small_free_count >= nchunks {
                            return true;
                        }
                    }
                }

                ChunkKind::Large => {
                    if release_small {
                        // free small chunks and coalesce until a large
                        // chunk forms, or until the large LRU tail becomes
                        // the older one
                        let stop_time = match large_victim {
                            Some(l) => self.table.title(l).time,
                            None => now,
                        };

                        if self.coalesce_free_small_chunks(stop_time, now)
                            == CoalesceProgress::NoProgress
                        {
                            return false;
                        }
                        if self.large_free_count >= nchunks {
                            return true;
                        }
                    }

                    if release_large {
                        let victim = large_victim.unwrap();
                        debug_assert_eq!(self.table.title(victim).refcount, 0);
                        self.do_item_unlink(victim, UnlinkReason::MaybeEvict, now);

                        if self.large_free_count >= nchunks {
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Copy one small chunk's payload bytes onto another.
    fn copy_small_payload(&mut self, src: ChunkPtr, dst: ChunkPtr) {
        let bytes = self
            .table
            .arena()
            .slice(src.byte_offset(), SMALL_CHUNK_SIZE)
            .to_vec();
        self.table
            .segment_bytes_mut(crate::storage::table::Segment {
                offset: dst.byte_offset(),
                len: SMALL_CHUNK_SIZE,
            })
            .copy_from_slice(&bytes);
    }
}
