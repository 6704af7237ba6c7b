// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Item lifecycle and command-level storage operations.
//!
//! Items are born by [`FlatStorage::item_alloc`] with one reference held
//! by the caller, enter the cache via link (index + LRU), are reached by
//! get (refcount bump), and die when the last reference drops on an
//! unlinked item. Values carry a trailing CRLF so the engine stays
//! drop-in compatible with an ASCII front end; `nbytes` includes it.

use std::net::Ipv4Addr;

use regex::Regex;
use tracing::debug;

use crate::core::error::{CacheError, Result};
use crate::core::time::RelTime;
use crate::storage::chunk::{
    chunks_needed, is_large_chunk, item_size_ok, ChunkKind, ItemFlags, ItemPtr, LargeChunk,
    SmallChunk, TitleHeader, ITEM_UPDATE_INTERVAL, LARGE_CHUNK_SIZE, SMALL_CHUNKS_PER_LARGE_CHUNK,
    SMALL_CHUNK_SIZE,
};
use crate::storage::table::Segment;
use crate::storage::{CoalesceProgress, DeferredDelete, FlatStorage, UnlinkReason};

/// Store-command semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
}

/// Outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemGet {
    /// Found; the caller now holds a reference.
    Hit(ItemPtr),
    Miss,
    /// Present but delete-locked; treated as a miss with a distinct
    /// status so delete/add can refuse properly.
    DeleteLocked,
}

impl FlatStorage {
    /// Allocate an item for `key` with an uninitialized value region of
    /// `nbytes`. The caller holds the initial reference. `addr` is stamped
    /// into trailing slack alongside the allocation time, best effort.
    pub fn item_alloc(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        addr: Option<Ipv4Addr>,
        now: RelTime,
    ) -> Result<ItemPtr> {
        if !item_size_ok(key.len(), nbytes) {
            return Err(CacheError::size_invalid(key.len(), nbytes));
        }

        let needed = chunks_needed(key.len(), nbytes);
        let it = if is_large_chunk(key.len(), nbytes) {
            self.reserve_large(needed, now)?;
            self.chain_large(key, flags, exptime, nbytes, needed)
        } else {
            self.reserve_small(needed, now)?;
            self.chain_small(key, flags, exptime, nbytes, needed)
        };

        self.table.copy_to_item(it, 0, key, false);
        self.table.stamp(it, now, addr);
        Ok(it)
    }

    /// Drive the large-chunk strategy ladder until `needed` large chunks
    /// are free: free list, arena growth, coalescing, LRU eviction.
    fn reserve_large(&mut self, needed: usize, now: RelTime) -> Result<()> {
        let mut prev_free = usize::MAX;
        while self.large_free_count < needed {
            debug_assert_ne!(prev_free, self.large_free_count, "allocator made no progress");
            prev_free = self.large_free_count;

            if self.arena_grow() {
                continue;
            }

            while self.small_free_count >= SMALL_CHUNKS_PER_LARGE_CHUNK
                && self.large_free_count < needed
            {
                if self.coalesce_free_small_chunks(now, now) == CoalesceProgress::NoProgress {
                    break;
                }
            }
            if prev_free != self.large_free_count {
                continue;
            }

            if self.evict_to_free && self.lru_evict(ChunkKind::Large, needed, now) {
                continue;
            }

            return Err(CacheError::out_of_memory(needed));
        }
        Ok(())
    }

    /// Drive the small-chunk strategy ladder: free list, breaking a large
    /// chunk, arena growth, LRU eviction.
    fn reserve_small(&mut self, needed: usize, now: RelTime) -> Result<()> {
        let mut prev_small = usize::MAX;
        let mut prev_large = usize::MAX;
        while self.small_free_count < needed {
            debug_assert!(
                prev_small != self.small_free_count || prev_large != self.large_free_count,
                "allocator made no progress"
            );
            prev_small = self.small_free_count;
            prev_large = self.large_free_count;

            if self.large_free_count > 0 {
                let chunk = self
                    .free_list_pop_large()
                    .expect("large free count said nonzero");
                self.break_large_chunk(chunk);
                continue;
            }

            if self.arena_grow() {
                continue;
            }

            if self.evict_to_free && self.lru_evict(ChunkKind::Small, needed, now) {
                continue;
            }

            return Err(CacheError::out_of_memory(needed));
        }
        Ok(())
    }

    fn chain_large(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        needed: usize,
    ) -> ItemPtr {
        let title_ptr = self.free_list_pop_large().expect("reserve_large ensured room");
        *self.table.large_mut(title_ptr.large_index()) = LargeChunk::Title(TitleHeader::new(
            key.len() as u8,
            nbytes as u32,
            flags,
            exptime,
        ));

        self.stats.large_title_chunks += 1;
        self.stats.large_body_chunks += (needed - 1) as u64;

        let mut prev = title_ptr;
        for _ in 1..needed {
            let body = self.free_list_pop_large().expect("reserve_large ensured room");
            *self.table.large_mut(body.large_index()) = LargeChunk::Body { next_chunk: None };
            match self.table.large_mut(prev.large_index()) {
                LargeChunk::Title(header) => header.next_chunk = Some(body),
                LargeChunk::Body { next_chunk } => *next_chunk = Some(body),
                _ => unreachable!(),
            }
            prev = body;
        }
        title_ptr
    }

    fn chain_small(
        &mut self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        nbytes: usize,
        needed: usize,
    ) -> ItemPtr {
        let title_ptr = self.free_list_pop_small().expect("reserve_small ensured room");
        *self.table.small_mut(title_ptr) = SmallChunk::Title(TitleHeader::new(
            key.len() as u8,
            nbytes as u32,
            flags,
            exptime,
        ));

        self.stats.small_title_chunks += 1;
        self.stats.small_body_chunks += (needed - 1) as u64;

        let mut prev = title_ptr;
        for _ in 1..needed {
            let body = self.free_list_pop_small().expect("reserve_small ensured room");
            *self.table.small_mut(body) = SmallChunk::Body {
                prev_chunk: prev,
                next_chunk: None,
            };
            match self.table.small_mut(prev) {
                SmallChunk::Title(header) => header.next_chunk = Some(body),
                SmallChunk::Body { next_chunk, .. } => *next_chunk = Some(body),
                _ => unreachable!(),
            }
            prev = body;
        }
        title_ptr
    }

    /// Return every chunk of an unreferenced, unlinked item to the free
    /// lists.
    pub(crate) fn item_free(&mut self, it: ItemPtr) {
        let header = *self.table.title(it);
        debug_assert_eq!(header.refcount, 0);
        debug_assert!(header.next.is_none() && header.prev.is_none() && header.h_next.is_none());
        debug_assert!(header.it_flags.contains(ItemFlags::VALID));
        debug_assert!(!header.it_flags.contains(ItemFlags::LINKED));

        let chain = self.table.chunk_chain(it);
        let segments: Vec<Segment> = chain
            .iter()
            .map(|ptr| Segment {
                offset: ptr.byte_offset(),
                len: if self.table.is_small_item(it) {
                    SMALL_CHUNK_SIZE
                } else {
                    LARGE_CHUNK_SIZE
                },
            })
            .collect();

        if self.table.is_small_item(it) {
            self.table.debug_clear(&segments);
            // bodies first, title last, merging as chunks come free
            for &body in chain.iter().skip(1) {
                self.free_list_push_small(body, true);
            }
            self.free_list_push_small(it, true);
            self.stats.small_body_chunks -= (chain.len() - 1) as u64;
            self.stats.small_title_chunks -= 1;
        } else {
            self.table.debug_clear(&segments);
            for &body in chain.iter().skip(1) {
                *self.table.large_mut(body.large_index()) = LargeChunk::Free { next: None };
                self.free_list_push_large(body.large_index());
            }
            *self.table.large_mut(it.large_index()) = LargeChunk::Free { next: None };
            self.free_list_push_large(it.large_index());
            self.stats.large_body_chunks -= (chain.len() - 1) as u64;
            self.stats.large_title_chunks -= 1;
        }
    }

    /// Link an item into the index and its LRU.
    pub fn do_item_link(&mut self, it: ItemPtr, now: RelTime) {
        {
            let header = self.table.title_mut(it);
            debug_assert!(header.it_flags.contains(ItemFlags::VALID));
            debug_assert!(!header.it_flags.contains(ItemFlags::LINKED));
            header.it_flags.set(ItemFlags::LINKED);
            header.time = now;
        }
        self.index.insert(&mut self.table, it);

        let header = self.table.title(it);
        self.stats.item_total_size += header.nkey as u64 + header.nbytes as u64;
        self.stats.curr_items += 1;
        self.stats.total_items += 1;

        self.item_link_q(it);
    }

    /// Unlink an item from the index and LRU; frees it when unreferenced.
    ///
    /// The linked test is load-bearing: the cache lock is dropped between
    /// a get and the following unlink, so another connection may have
    /// raced the removal.
    pub fn do_item_unlink(&mut self, it: ItemPtr, reason: UnlinkReason, now: RelTime) {
        {
            let header = self.table.title(it);
            debug_assert!(header.it_flags.contains(ItemFlags::VALID));
            if !header.it_flags.contains(ItemFlags::LINKED) {
                return;
            }
        }

        let header = *self.table.title(it);
        let reason = match reason {
            UnlinkReason::MaybeEvict => {
                if header.exptime == 0 || header.exptime > now {
                    UnlinkReason::IsEvict
                } else {
                    UnlinkReason::IsExpired
                }
            }
            other => other,
        };

        self.table.title_mut(it).it_flags.clear(ItemFlags::LINKED);
        self.stats.item_total_size -= header.nkey as u64 + header.nbytes as u64;
        self.stats.curr_items -= 1;
        match reason {
            UnlinkReason::IsEvict => self.stats.evictions += 1,
            UnlinkReason::IsExpired => self.stats.expirations += 1,
            _ => {}
        }

        self.index.delete(&mut self.table, it);
        self.item_unlink_q(it);

        if self.table.title(it).refcount == 0 {
            self.item_free(it);
        }
    }

    /// Drop one reference; frees the item if it is unlinked and this was
    /// the last one.
    pub fn do_item_deref(&mut self, it: ItemPtr) {
        let (refcount, linked) = {
            let header = self.table.title_mut(it);
            debug_assert!(header.it_flags.contains(ItemFlags::VALID));
            if header.refcount != 0 {
                header.refcount -= 1;
            }
            (header.refcount, header.it_flags.contains(ItemFlags::LINKED))
        };
        if refcount == 0 && !linked {
            self.item_free(it);
        }
    }

    /// Reposition an item at its LRU head, throttled so hot keys do not
    /// churn the queue.
    pub fn do_item_update(&mut self, it: ItemPtr, now: RelTime) {
        let header = *self.table.title(it);
        if header.time < now.saturating_sub(ITEM_UPDATE_INTERVAL) {
            debug_assert!(header.it_flags.contains(ItemFlags::VALID));
            if header.it_flags.contains(ItemFlags::LINKED) {
                self.item_unlink_q(it);
                self.table.title_mut(it).time = now;
                self.item_link_q(it);
            }
        }
    }

    /// Swap `new_it` in for whatever the index currently holds under
    /// `old`'s key. `old` may have been unlinked by a racing thread; the
    /// key is re-resolved in that case.
    pub fn do_item_replace(&mut self, old: ItemPtr, new_it: ItemPtr, now: RelTime) {
        let target = if self.table.title(old).it_flags.contains(ItemFlags::LINKED) {
            Some(old)
        } else {
            let key = self.table.key_copy(new_it);
            self.index.find(&self.table, &key)
        };

        if let Some(target) = target {
            debug_assert!(self
                .table
                .title(target)
                .it_flags
                .contains(ItemFlags::LINKED));
            self.do_item_unlink(target, UnlinkReason::Normal, now);
        }
        self.do_item_link(new_it, now);
    }

    /// Look up a key, lazily expiring and honoring the delete lock. On a
    /// hit the caller holds a new reference.
    pub fn item_get(&mut self, key: &[u8], now: RelTime) -> ItemGet {
        let Some(it) = self.index.find(&self.table, key) else {
            return ItemGet::Miss;
        };

        let header = *self.table.title(it);

        if header.it_flags.contains(ItemFlags::DELETED) && now < header.exptime {
            return ItemGet::DeleteLocked;
        }

        if self.oldest_live != 0 && self.oldest_live <= now && header.time <= self.oldest_live {
            self.do_item_unlink(it, UnlinkReason::IsExpired, now);
            return ItemGet::Miss;
        }

        if header.exptime != 0 && header.exptime <= now {
            self.do_item_unlink(it, UnlinkReason::IsExpired, now);
            return ItemGet::Miss;
        }

        self.table.title_mut(it).refcount += 1;
        ItemGet::Hit(it)
    }

    /// Look up a key ignoring expiry and delete locks; bumps the refcount
    /// on a hit.
    pub fn item_get_nocheck(&mut self, key: &[u8]) -> Option<ItemPtr> {
        let it = self.index.find(&self.table, key)?;
        self.table.title_mut(it).refcount += 1;
        Some(it)
    }

    /// Store `it` under set/add/replace/append semantics. Returns whether
    /// the item was stored. The caller keeps its reference to `it` and
    /// must deref it afterwards either way.
    pub fn store_item(&mut self, it: ItemPtr, mode: StoreMode, now: RelTime) -> bool {
        let key = self.table.key_copy(it);

        match mode {
            StoreMode::Set => {
                match self.item_get(&key, now) {
                    ItemGet::Hit(old) => {
                        self.do_item_replace(old, it, now);
                        self.do_item_deref(old);
                    }
                    ItemGet::DeleteLocked => {
                        // set overrides a pending delete
                        if let Some(old) = self.item_get_nocheck(&key) {
                            self.do_item_replace(old, it, now);
                            self.do_item_deref(old);
                        } else {
                            self.do_item_link(it, now);
                        }
                    }
                    ItemGet::Miss => self.do_item_link(it, now),
                }
                true
            }

            StoreMode::Add => match self.item_get(&key, now) {
                ItemGet::Hit(old) => {
                    self.do_item_deref(old);
                    false
                }
                ItemGet::DeleteLocked => false,
                ItemGet::Miss => {
                    self.do_item_link(it, now);
                    true
                }
            },

            StoreMode::Replace => match self.item_get(&key, now) {
                ItemGet::Hit(old) => {
                    self.do_item_replace(old, it, now);
                    self.do_item_deref(old);
                    true
                }
                _ => false,
            },

            StoreMode::Append => match self.item_get(&key, now) {
                ItemGet::Hit(old) => {
                    let stored = self.append_item(old, it, now);
                    self.do_item_deref(old);
                    stored
                }
                _ => false,
            },
        }
    }

    /// Concatenate `suffix_it`'s value onto `old`'s into a fresh item and
    /// swap it in.
    fn append_item(&mut self, old: ItemPtr, suffix_it: ItemPtr, now: RelTime) -> bool {
        let old_header = *self.table.title(old);
        let suffix_header = *self.table.title(suffix_it);

        let key = self.table.key_copy(old);
        let old_value = self.table.copy_from_item(
            old,
            old_header.nkey as usize,
            old_header.nbytes as usize - 2,
        );
        let suffix = self.table.copy_from_item(
            suffix_it,
            suffix_header.nkey as usize,
            suffix_header.nbytes as usize - 2,
        );

        let nbytes = old_value.len() + suffix.len() + 2;
        let combined = match self.item_alloc(
            &key,
            old_header.flags,
            old_header.exptime,
            nbytes,
            None,
            now,
        ) {
            Ok(it) => it,
            Err(err) => {
                debug!(error = %err, "append reallocation failed");
                return false;
            }
        };

        let nkey = key.len();
        self.table.copy_to_item(combined, nkey, &old_value, false);
        self.table
            .copy_to_item(combined, nkey + old_value.len(), &suffix, false);
        self.table
            .copy_to_item(combined, nkey + old_value.len() + suffix.len(), b"\r\n", false);

        self.do_item_replace(old, combined, now);
        self.do_item_deref(combined);
        true
    }

    /// Apply incr/decr to a numeric value. Rewrites in place when the new
    /// rendering fits (space-padded), reallocates otherwise. Returns the
    /// new value.
    pub fn add_delta(&mut self, it: ItemPtr, incr: bool, delta: u32, now: RelTime) -> Result<u32> {
        let header = *self.table.title(it);
        let nkey = header.nkey as usize;
        let vlen = header.nbytes as usize;
        if vlen < 2 {
            return Err(CacheError::numeric_parse("value too short"));
        }

        // a previous in-place rewrite may have left trailing space padding
        let raw = self.table.copy_from_item(it, nkey, vlen - 2);
        let digit_count = raw.iter().take_while(|b| b.is_ascii_digit()).count();
        if digit_count == 0 || raw[digit_count..].iter().any(|&b| b != b' ') {
            return Err(CacheError::numeric_parse("cannot parse non-numeric value"));
        }
        let old_value: u32 = std::str::from_utf8(&raw[..digit_count])
            .expect("digits are ascii")
            .parse()
            .map_err(|_| CacheError::numeric_range("value does not fit in 32 bits"))?;

        let new_value = if incr {
            old_value.wrapping_add(delta)
        } else {
            old_value.saturating_sub(delta)
        };

        let rendered = new_value.to_string();
        if rendered.len() <= raw.len() {
            // pad to the old width so nbytes stays put
            let mut buf = rendered.into_bytes();
            buf.resize(raw.len(), b' ');
            self.table.copy_to_item(it, nkey, &buf, false);
            Ok(new_value)
        } else {
            let key = self.table.key_copy(it);
            let nbytes = rendered.len() + 2;
            let fresh = self.item_alloc(&key, header.flags, header.exptime, nbytes, None, now)?;
            self.table.copy_to_item(fresh, key.len(), rendered.as_bytes(), false);
            self.table
                .copy_to_item(fresh, key.len() + rendered.len(), b"\r\n", false);
            self.do_item_replace(it, fresh, now);
            self.do_item_deref(fresh);
            Ok(new_value)
        }
    }

    /// Set the flush watermark: items last touched at or before it are
    /// lazily expired.
    pub fn set_oldest_live(&mut self, oldest: RelTime) {
        self.oldest_live = oldest;
    }

    /// Eagerly expire flushed items by walking both LRU heads. Stops at
    /// the first item younger than the watermark in each queue, which is
    /// sound because LRUs are time-ordered.
    pub fn flush_expired(&mut self, now: RelTime) {
        if self.oldest_live == 0 {
            return;
        }

        for kind in [ChunkKind::Small, ChunkKind::Large] {
            let mut cursor = self.lru(kind).head;
            while let Some(it) = cursor {
                let header = *self.table.title(it);
                if header.time < self.oldest_live {
                    break;
                }
                cursor = header.next;
                debug_assert!(header.it_flags.contains(ItemFlags::LINKED));
                self.do_item_unlink(it, UnlinkReason::IsExpired, now);
            }
        }
    }

    /// Park a delete until `deadline`; the queue takes over the caller's
    /// reference. The item stays in the index, answering gets as
    /// delete-locked until the window elapses.
    pub fn defer_delete(&mut self, it: ItemPtr, deadline: RelTime) {
        let header = self.table.title_mut(it);
        header.it_flags.set(ItemFlags::DELETED);
        header.exptime = deadline;
        self.deferred.push(DeferredDelete { item: it, deadline });
    }

    /// Reap deferred deletes whose window has elapsed. Called on timer
    /// ticks.
    pub fn run_deferred_deletes(&mut self, now: RelTime) {
        let due: Vec<DeferredDelete> = {
            let (due, pending) = self.deferred.drain(..).partition(|d| d.deadline <= now);
            self.deferred = pending;
            due
        };
        for entry in due {
            self.table
                .title_mut(entry.item)
                .it_flags
                .clear(ItemFlags::DELETED);
            self.do_item_unlink(entry.item, UnlinkReason::Normal, now);
            self.do_item_deref(entry.item);
        }
    }

    /// Unlink every item whose key matches `pattern`, as expired. Returns
    /// the number of items removed. Non-UTF-8 keys are matched lossily.
    pub fn expire_regex(&mut self, pattern: &Regex, now: RelTime) -> usize {
        let mut removed = 0;
        for it in self.index.items(&self.table) {
            let key = self.table.key_copy(it);
            if pattern.is_match(&String::from_utf8_lossy(&key)) {
                self.do_item_unlink(it, UnlinkReason::IsExpired, now);
                removed += 1;
            }
        }
        removed
    }

    /// Stamp the protocol CRLF terminator into a freshly allocated
    /// builder item and hand back the receivable value segments.
    pub fn prepare_value_receive(&mut self, it: ItemPtr) -> Vec<Segment> {
        let header = *self.table.title(it);
        let nkey = header.nkey as usize;
        let nbytes = header.nbytes as usize;
        self.table
            .copy_to_item(it, nkey + nbytes - 2, b"\r\n", false);
        self.table.walk(it, nkey, nbytes - 2, false)
    }

    /// Segments covering an item's value, excluding the trailing CRLF;
    /// feeds the zero-copy reply path.
    pub fn value_segments(&self, it: ItemPtr) -> Vec<Segment> {
        let header = self.table.title(it);
        self.table.walk(
            it,
            header.nkey as usize,
            header.nbytes as usize - 2,
            false,
        )
    }

    /// Write into an item's value region, `offset` bytes past the key.
    /// Embedders and the arithmetic path use this; the network path
    /// writes through the zero-copy receive segments instead.
    pub fn write_value(&mut self, it: ItemPtr, offset: usize, bytes: &[u8]) {
        let nkey = self.table.title(it).nkey as usize;
        self.table.copy_to_item(it, nkey + offset, bytes, false);
    }

    /// Copy out an item's value without the trailing CRLF.
    pub fn value_copy(&self, it: ItemPtr) -> Vec<u8> {
        let header = self.table.title(it);
        self.table
            .copy_from_item(it, header.nkey as usize, header.nbytes as usize - 2)
    }

    /// Dump LRU contents in the classic text shape, newest first.
    pub fn cachedump(&self, kind: ChunkKind, limit: usize) -> String {
        let mut out = String::new();
        let mut cursor = self.lru(kind).head;
        let mut shown = 0;
        while let Some(it) = cursor {
            if limit != 0 && shown >= limit {
                break;
            }
            let header = self.table.title(it);
            let key = self.table.key_copy(it);
            out.push_str(&format!(
                "ITEM {} [{} b; {} s]\r\n",
                String::from_utf8_lossy(&key),
                header.nbytes,
                header.time
            ));
            shown += 1;
            cursor = header.next;
        }
        out.push_str("END\r\n");
        out
    }

    /// Histogram of item footprints in 32-byte buckets, classic shape.
    pub fn stats_sizes(&self) -> String {
        let mut histogram: std::collections::BTreeMap<usize, u64> = std::collections::BTreeMap::new();
        for kind in [ChunkKind::Small, ChunkKind::Large] {
            let chunk_size = match kind {
                ChunkKind::Small => SMALL_CHUNK_SIZE,
                ChunkKind::Large => LARGE_CHUNK_SIZE,
            };
            let mut cursor = self.lru(kind).head;
            while let Some(it) = cursor {
                let header = self.table.title(it);
                let ntotal =
                    chunks_needed(header.nkey as usize, header.nbytes as usize) * chunk_size;
                let bucket = ntotal.div_ceil(32) * 32;
                *histogram.entry(bucket).or_default() += 1;
                cursor = header.next;
            }
        }

        let mut out = String::new();
        for (bucket, count) in histogram {
            out.push_str(&format!("{bucket} {count}\r\n"));
        }
        out.push_str("END\r\n");
        out
    }
}
