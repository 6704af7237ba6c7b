// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Associative index: key bytes → item.
//!
//! A flat chained hash table sized to a power of two, with items threaded
//! through their headers' `h_next` links. Expansion is lazy: once the item
//! count passes 1.5× the bucket count, a doubled table is allocated and
//! one bucket of the old table migrates per [`HashIndex::move_next_bucket`]
//! tick, so no single operation pays the full rehash.

use std::hash::{BuildHasher, RandomState};

use crate::storage::chunk::ItemPtr;
use crate::storage::table::ChunkTable;

/// The chained hash index.
pub struct HashIndex {
    primary: Vec<Option<ItemPtr>>,
    /// Old table during incremental expansion.
    old: Vec<Option<ItemPtr>>,
    /// Next old-table bucket to migrate.
    expand_bucket: usize,
    expanding: bool,
    count: usize,
    hasher: RandomState,
}

impl HashIndex {
    /// Create an index with `2^hash_power` buckets.
    pub fn new(hash_power: u8) -> Self {
        HashIndex {
            primary: vec![None; 1 << hash_power],
            old: Vec::new(),
            expand_bucket: 0,
            expanding: false,
            count: 0,
            hasher: RandomState::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn hash(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    /// The bucket slot a hash currently resolves to, considering an
    /// expansion in flight.
    fn bucket_slot(&mut self, hash: u64) -> &mut Option<ItemPtr> {
        if self.expanding {
            let old_bucket = (hash as usize) & (self.old.len() - 1);
            if old_bucket >= self.expand_bucket {
                return &mut self.old[old_bucket];
            }
        }
        let bucket = (hash as usize) & (self.primary.len() - 1);
        &mut self.primary[bucket]
    }

    fn bucket_head(&self, hash: u64) -> Option<ItemPtr> {
        if self.expanding {
            let old_bucket = (hash as usize) & (self.old.len() - 1);
            if old_bucket >= self.expand_bucket {
                return self.old[old_bucket];
            }
        }
        self.primary[(hash as usize) & (self.primary.len() - 1)]
    }

    /// Find an item by key: compares length first, then bytes.
    pub fn find(&self, table: &ChunkTable, key: &[u8]) -> Option<ItemPtr> {
        let mut cursor = self.bucket_head(self.hash(key));
        while let Some(it) = cursor {
            if table.key_eq(it, key) {
                return Some(it);
            }
            cursor = table.title(it).h_next;
        }
        None
    }

    /// Prepend an item to its bucket. The key must not already be present.
    pub fn insert(&mut self, table: &mut ChunkTable, it: ItemPtr) {
        let key = table.key_copy(it);
        debug_assert!(self.find(table, &key).is_none(), "duplicate insert");

        let slot = self.bucket_slot(self.hash(&key));
        let old_head = *slot;
        *slot = Some(it);
        table.title_mut(it).h_next = old_head;

        self.count += 1;
        if !self.expanding && self.count > self.primary.len() + self.primary.len() / 2 {
            self.start_expansion();
        }
    }

    /// Unlink an item from its bucket by identity.
    pub fn delete(&mut self, table: &mut ChunkTable, it: ItemPtr) {
        let key = table.key_copy(it);
        let slot = self.bucket_slot(self.hash(&key));

        let mut cursor = *slot;
        let mut prev: Option<ItemPtr> = None;
        while let Some(current) = cursor {
            if current == it {
                let next = table.title(current).h_next;
                match prev {
                    Some(prev) => table.title_mut(prev).h_next = next,
                    None => *self.bucket_slot(self.hash(&key)) = next,
                }
                table.title_mut(it).h_next = None;
                self.count -= 1;
                return;
            }
            prev = Some(current);
            cursor = table.title(current).h_next;
        }
        panic!("deleting an item that is not in the index");
    }

    /// Replace `old` with `new` in place (same key); used when a title
    /// chunk migrates during coalescing. The chain link is carried over by
    /// the caller having copied the header.
    pub fn update(&mut self, table: &mut ChunkTable, old: ItemPtr, new: ItemPtr) {
        let key = table.key_copy(new);
        let slot = self.bucket_slot(self.hash(&key));

        let mut cursor = *slot;
        let mut prev: Option<ItemPtr> = None;
        while let Some(current) = cursor {
            if current == old {
                match prev {
                    Some(prev) => table.title_mut(prev).h_next = Some(new),
                    None => *self.bucket_slot(self.hash(&key)) = Some(new),
                }
                return;
            }
            prev = Some(current);
            cursor = table.title(current).h_next;
        }
        panic!("updating an item that is not in the index");
    }

    /// Every item currently linked, across both tables.
    pub fn items(&self, table: &ChunkTable) -> Vec<ItemPtr> {
        let mut out = Vec::with_capacity(self.count);
        let buckets = self
            .primary
            .iter()
            .chain(self.expanding.then_some(&self.old).into_iter().flatten());
        for &head in buckets {
            let mut cursor = head;
            while let Some(it) = cursor {
                out.push(it);
                cursor = table.title(it).h_next;
            }
        }
        out
    }

    fn start_expansion(&mut self) {
        debug_assert!(!self.expanding);
        let doubled = vec![None; self.primary.len() * 2];
        self.old = std::mem::replace(&mut self.primary, doubled);
        self.expand_bucket = 0;
        self.expanding = true;
    }

    /// Migrate one bucket of the old table into the primary table.
    /// A no-op when no expansion is in flight.
    pub fn move_next_bucket(&mut self, table: &mut ChunkTable) {
        if !self.expanding {
            return;
        }

        let mut cursor = self.old[self.expand_bucket].take();
        while let Some(it) = cursor {
            cursor = table.title(it).h_next;
            let key = table.key_copy(it);
            let bucket = (self.hash(&key) as usize) & (self.primary.len() - 1);
            table.title_mut(it).h_next = self.primary[bucket];
            self.primary[bucket] = Some(it);
        }

        self.expand_bucket += 1;
        if self.expand_bucket >= self.old.len() {
            self.expanding = false;
            self.old = Vec::new();
        }
    }
}
