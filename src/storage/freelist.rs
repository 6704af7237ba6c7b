// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Free lists and large-chunk break/unbreak.
//!
//! Both lists are LIFO. The large list is singly linked: elements only
//! ever leave from the head. The small list is doubly linked because
//! unbreak and coalescing remove arbitrary elements. Breaking a large
//! chunk pushes its children in reverse slot order so subsequent pops
//! allocate slots in ascending physical order within one parent.

use crate::storage::chunk::{
    BrokenChunk, ChunkPtr, LargeChunk, SmallChunk, LARGE_CHUNK_SIZE, SMALL_CHUNKS_PER_LARGE_CHUNK,
};
use crate::storage::FlatStorage;

impl FlatStorage {
    /// Initialize one more arena increment and push the new chunks onto
    /// the large free list. Returns false when the arena is exhausted.
    pub(crate) fn arena_grow(&mut self) -> bool {
        let Some(range) = self.table.grow() else {
            return false;
        };
        self.stats.storage_allocated += (range.len() * LARGE_CHUNK_SIZE) as u64;
        for index in range {
            self.free_list_push_large(index);
        }
        true
    }

    /// Push a detached large chunk onto the large free list.
    pub(crate) fn free_list_push_large(&mut self, index: usize) {
        debug_assert!(matches!(self.table.large(index), LargeChunk::Free { .. }),
            "pushing a non-detached large chunk");
        *self.table.large_mut(index) = LargeChunk::Free {
            next: self.large_free_head,
        };
        self.large_free_head = Some(ChunkPtr::from_parts(index, 0));
        self.large_free_count += 1;
    }

    /// Pop the head of the large free list. The returned chunk is
    /// detached; the caller assigns its real state.
    pub(crate) fn free_list_pop_large(&mut self) -> Option<ChunkPtr> {
        let head = self.large_free_head?;
        let LargeChunk::Free { next } = *self.table.large(head.large_index()) else {
            panic!("large free list head {head:?} is not free");
        };
        self.large_free_head = next;
        self.large_free_count -= 1;
        *self.table.large_mut(head.large_index()) = LargeChunk::Free { next: None };
        Some(head)
    }

    /// Push a small chunk onto the small free list, decrementing the
    /// parent's allocated count. With `try_merge`, unbreak the parent if
    /// it just became fully free.
    pub(crate) fn free_list_push_small(&mut self, ptr: ChunkPtr, try_merge: bool) {
        let parent = ptr.large_index();
        let allocated = self.broken_dec_allocated(parent);

        let old_head = self.small_free_head;
        *self.table.small_mut(ptr) = SmallChunk::Free {
            prev: None,
            next: old_head,
        };
        if let Some(head) = old_head {
            match self.table.small_mut(head) {
                SmallChunk::Free { prev, .. } => *prev = Some(ptr),
                other => panic!("small free head {head:?} is not free: {other:?}"),
            }
        }
        self.small_free_head = Some(ptr);
        self.small_free_count += 1;

        if try_merge && allocated == 0 {
            self.unbreak_large_chunk(parent, false);
        }
    }

    /// Pop the head of the small free list, incrementing the parent's
    /// allocated count. The returned chunk is off-list as
    /// `CoalescePending` until the caller assigns title/body state.
    pub(crate) fn free_list_pop_small(&mut self) -> Option<ChunkPtr> {
        let head = self.small_free_head?;
        let SmallChunk::Free { prev, next } = *self.table.small(head) else {
            panic!("small free list head {head:?} is not free");
        };
        debug_assert!(prev.is_none());

        self.small_free_head = next;
        if let Some(next) = next {
            match self.table.small_mut(next) {
                SmallChunk::Free { prev, .. } => *prev = None,
                other => panic!("small free link {next:?} is not free: {other:?}"),
            }
        }
        self.small_free_count -= 1;
        *self.table.small_mut(head) = SmallChunk::CoalescePending;

        self.broken_inc_allocated(head.large_index());
        Some(head)
    }

    /// Unlink a small chunk from an arbitrary position in the free list.
    /// Does not touch the parent's allocated count; the chunk stays free
    /// conceptually and is marked `CoalescePending`.
    pub(crate) fn remove_small_from_free_list(&mut self, ptr: ChunkPtr) {
        let SmallChunk::Free { prev, next } = *self.table.small(ptr) else {
            panic!("removing non-free small chunk {ptr:?} from free list");
        };

        match prev {
            Some(prev) => match self.table.small_mut(prev) {
                SmallChunk::Free { next: prev_next, .. } => *prev_next = next,
                other => panic!("small free link {prev:?} is not free: {other:?}"),
            },
            None => {
                debug_assert_eq!(self.small_free_head, Some(ptr));
                self.small_free_head = next;
            }
        }
        if let Some(next) = next {
            match self.table.small_mut(next) {
                SmallChunk::Free { prev: next_prev, .. } => *next_prev = prev,
                other => panic!("small free link {next:?} is not free: {other:?}"),
            }
        }

        *self.table.small_mut(ptr) = SmallChunk::CoalescePending;
        self.small_free_count -= 1;
    }

    /// Break a detached large chunk into small chunks on the free list.
    pub(crate) fn break_large_chunk(&mut self, ptr: ChunkPtr) {
        let index = ptr.large_index();
        debug_assert_eq!(ptr.small_index(), 0);
        debug_assert!(matches!(self.table.large(index), LargeChunk::Free { .. }));

        // Seed allocated to the child count so each push's decrement lands
        // at zero once all children are listed.
        let mut broken = BrokenChunk::new();
        broken.allocated = SMALL_CHUNKS_PER_LARGE_CHUNK as u8;
        *self.table.large_mut(index) = LargeChunk::Broken(broken);
        self.stats.broken_chunk_histogram[SMALL_CHUNKS_PER_LARGE_CHUNK] += 1;

        for slot in (0..SMALL_CHUNKS_PER_LARGE_CHUNK).rev() {
            self.free_list_push_small(ChunkPtr::from_parts(index, slot), false);
        }

        self.stats.large_broken_chunks += 1;
        self.stats.break_events += 1;
    }

    /// Restore a broken chunk whose children are all free (or, with
    /// `mandatory`, all free/coalesce-pending after migration) into one
    /// free large chunk.
    pub(crate) fn unbreak_large_chunk(&mut self, index: usize, mandatory: bool) {
        {
            let LargeChunk::Broken(broken) = self.table.large(index) else {
                panic!("unbreaking non-broken chunk {index}");
            };
            if !mandatory && broken.allocated != 0 {
                return;
            }
            debug_assert_eq!(broken.allocated, 0, "unbreak with used children");
        }

        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
            let ptr = ChunkPtr::from_parts(index, slot);
            match *self.table.small(ptr) {
                SmallChunk::Free { .. } => self.remove_small_from_free_list(ptr),
                SmallChunk::CoalescePending => {}
                ref other => panic!("unbreak found a used child {ptr:?}: {other:?}"),
            }
        }

        *self.table.large_mut(index) = LargeChunk::Free { next: None };
        self.free_list_push_large(index);

        self.stats.large_broken_chunks -= 1;
        self.stats.broken_chunk_histogram[0] -= 1;
        self.stats.unbreak_events += 1;
    }

    fn broken_dec_allocated(&mut self, index: usize) -> u8 {
        let LargeChunk::Broken(broken) = self.table.large_mut(index) else {
            panic!("chunk {index} is not broken");
        };
        debug_assert!(broken.allocated > 0);
        let before = broken.allocated as usize;
        broken.allocated -= 1;
        let after = broken.allocated;
        self.stats.broken_chunk_histogram[before] -= 1;
        self.stats.broken_chunk_histogram[before - 1] += 1;
        after
    }

    fn broken_inc_allocated(&mut self, index: usize) -> u8 {
        let LargeChunk::Broken(broken) = self.table.large_mut(index) else {
            panic!("chunk {index} is not broken");
        };
        let before = broken.allocated as usize;
        broken.allocated += 1;
        debug_assert!(broken.allocated as usize <= SMALL_CHUNKS_PER_LARGE_CHUNK);
        let after = broken.allocated;
        self.stats.broken_chunk_histogram[before] -= 1;
        self.stats.broken_chunk_histogram[before + 1] += 1;
        after
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::chunk::{LARGE_CHUNK_SIZE, SMALL_CHUNKS_PER_LARGE_CHUNK};
    use crate::storage::{FlatStorage, StorageConfig};

    fn small_storage() -> FlatStorage {
        let mut config = StorageConfig::new(LARGE_CHUNK_SIZE * 16);
        config.grow_delta = LARGE_CHUNK_SIZE * 8;
        config.hash_power = 4;
        FlatStorage::new(config).unwrap()
    }

    #[test]
    fn test_initial_growth_fills_large_free_list() {
        let storage = small_storage();
        assert_eq!(storage.large_free_count(), 8);
        assert_eq!(storage.small_free_count(), 0);
        assert_eq!(storage.stats.storage_allocated, (LARGE_CHUNK_SIZE * 8) as u64);
    }

    #[test]
    fn test_grow_until_exhausted() {
        let mut storage = small_storage();
        assert!(storage.arena_grow());
        assert_eq!(storage.large_free_count(), 16);
        assert!(!storage.arena_grow());
        assert_eq!(storage.large_free_count(), 16);
    }

    #[test]
    fn test_large_list_is_lifo() {
        let mut storage = small_storage();
        let first = storage.free_list_pop_large().unwrap();
        let second = storage.free_list_pop_large().unwrap();
        assert_ne!(first, second);
        assert_eq!(storage.large_free_count(), 6);

        storage.free_list_push_large(first.large_index());
        assert_eq!(storage.free_list_pop_large(), Some(first));
        storage.free_list_push_large(second.large_index());
        storage.free_list_push_large(first.large_index());
    }

    #[test]
    fn test_break_populates_small_list_in_slot_order() {
        let mut storage = small_storage();
        let lc = storage.free_list_pop_large().unwrap();
        storage.break_large_chunk(lc);

        assert_eq!(storage.small_free_count(), SMALL_CHUNKS_PER_LARGE_CHUNK);
        assert_eq!(storage.stats.break_events, 1);
        assert_eq!(storage.stats.broken_chunk_histogram[0], 1);

        // reverse-order push means pops come back in ascending slot order
        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
            let sc = storage.free_list_pop_small().unwrap();
            assert_eq!(sc.large_index(), lc.large_index());
            assert_eq!(sc.small_index(), slot);
        }
        assert_eq!(storage.small_free_count(), 0);
        assert_eq!(
            storage.stats.broken_chunk_histogram[SMALL_CHUNKS_PER_LARGE_CHUNK],
            1
        );
    }

    #[test]
    fn test_push_small_with_merge_unbreaks_parent() {
        let mut storage = small_storage();
        let large_before = storage.large_free_count();
        let lc = storage.free_list_pop_large().unwrap();
        storage.break_large_chunk(lc);

        let mut popped = Vec::new();
        for _ in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
            popped.push(storage.free_list_pop_small().unwrap());
        }

        // returning every child with try_merge coalesces the parent back
        for sc in popped {
            storage.free_list_push_small(sc, true);
        }
        assert_eq!(storage.small_free_count(), 0);
        assert_eq!(storage.large_free_count(), large_before);
        assert_eq!(storage.stats.unbreak_events, 1);
        assert_eq!(storage.stats.large_broken_chunks, 0);
    }

    #[test]
    fn test_unbreak_requires_all_free_unless_mandatory() {
        let mut storage = small_storage();
        let lc = storage.free_list_pop_large().unwrap();
        storage.break_large_chunk(lc);
        let _held = storage.free_list_pop_small().unwrap();

        // one child allocated: non-mandatory unbreak declines
        storage.unbreak_large_chunk(lc.large_index(), false);
        assert_eq!(storage.stats.unbreak_events, 0);
        assert_eq!(
            storage.small_free_count(),
            SMALL_CHUNKS_PER_LARGE_CHUNK - 1
        );
    }
}
