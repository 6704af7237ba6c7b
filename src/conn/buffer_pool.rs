// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Connection-buffer pool.
//!
//! Connections draw their read/scratch buffers from a process-wide pool of
//! large anonymous maps. Each buffer reserves a big virtual range (16 MiB
//! by default) but only the touched pages become resident, and the pool
//! tracks each buffer's page-rounded *peak* usage. Free buffers sit in a
//! max-heap keyed on that peak so the most-used buffer is handed out
//! first, concentrating the resident working set in a few hot buffers.
//!
//! When aggregate resident size crosses the configured top watermark, the
//! pool enters reclamation and destroys free buffers until it drops below
//! the bottom watermark (hysteresis prevents thrash). Buffers whose
//! reported peak reaches `buffer_rsize_limit` are destroyed on release
//! rather than recycled.
//!
//! The optional corruption-detection mode remaps every destroyed buffer's
//! address range `PROT_NONE` so stale pointers fault instead of silently
//! reading recycled memory.

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::ptr::NonNull;

use tracing::{debug, warn};

/// Virtual size of one connection buffer.
pub const CONN_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Peak usage at or above which a released buffer is destroyed.
pub const BUFFER_RSIZE_LIMIT_DEFAULT: usize = 128 * 1024;

/// Reclamation stops once aggregate resident size drops below this.
pub const TOTAL_RSIZE_BOTTOM_DEFAULT: usize = 8 * 1024 * 1024;

/// Reclamation starts once aggregate resident size reaches this.
pub const TOTAL_RSIZE_TOP_DEFAULT: usize = 16 * 1024 * 1024;

/// Buffers mapped at pool construction.
pub const INITIAL_BUFFER_COUNT_DEFAULT: usize = 8;

/// Placement retries when freezing a destroyed range `PROT_NONE`.
const REMAP_ATTEMPTS: usize = 50;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnBufferConfig {
    pub buffer_size: usize,
    pub initial_count: usize,
    pub buffer_rsize_limit: usize,
    pub total_rsize_bottom: usize,
    pub total_rsize_top: usize,
    /// Remap destroyed buffers PROT_NONE to trap use-after-free.
    pub detect_corruption: bool,
}

impl Default for ConnBufferConfig {
    fn default() -> Self {
        ConnBufferConfig {
            buffer_size: CONN_BUFFER_SIZE,
            initial_count: INITIAL_BUFFER_COUNT_DEFAULT,
            buffer_rsize_limit: BUFFER_RSIZE_LIMIT_DEFAULT,
            total_rsize_bottom: TOTAL_RSIZE_BOTTOM_DEFAULT,
            total_rsize_top: TOTAL_RSIZE_TOP_DEFAULT,
            detect_corruption: false,
        }
    }
}

impl ConnBufferConfig {
    /// Derive watermarks from the configured ceiling.
    pub fn with_ceiling(max_bytes: usize) -> Self {
        let top = max_bytes.max(1024 * 1024);
        ConnBufferConfig {
            total_rsize_top: top,
            total_rsize_bottom: top / 2,
            ..Default::default()
        }
    }
}

/// Pool counters, reported through the stats command.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnBufferStats {
    pub allocs: u64,
    pub frees: u64,
    pub destroys: u64,
    pub reclamations_started: u64,
    pub allocs_failed: u64,
}

/// Handle to a checked-out buffer. The underlying map stays valid until
/// the handle is returned with [`ConnBufferPool::free`]; dropping a handle
/// without returning it leaks the buffer from the pool's point of view.
#[derive(Debug)]
pub struct ConnBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is an exclusive checkout of an anonymous map; only
// the owning connection touches it until it is returned.
unsafe impl Send for ConnBuffer {}

impl ConnBuffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The buffer as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the range [ptr, ptr+len) is a private mapping owned
        // exclusively by this handle while checked out.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The buffer as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// A free buffer in the heap, ordered by peak usage alone.
struct FreeBuffer {
    max_rusage: usize,
    addr: usize,
}

impl PartialEq for FreeBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.max_rusage == other.max_rusage
    }
}
impl Eq for FreeBuffer {}
impl PartialOrd for FreeBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FreeBuffer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.max_rusage.cmp(&other.max_rusage)
    }
}

struct BufferRecord {
    max_rusage: usize,
    prev_rusage: usize,
    rusage_updated: bool,
}

/// The pool. The server wraps it in a mutex; all operations take `&mut`.
pub struct ConnBufferPool {
    config: ConnBufferConfig,
    page_size: usize,
    free: BinaryHeap<FreeBuffer>,
    /// Every live buffer (free or checked out), keyed by base address.
    records: HashMap<usize, BufferRecord>,
    total_rsize: usize,
    total_rsize_in_freelist: usize,
    reclamation_in_progress: bool,
    pub stats: ConnBufferStats,
}

// SAFETY: raw addresses in the records map are plain bookkeeping; the
// maps they denote are process-private.
unsafe impl Send for ConnBufferPool {}

impl ConnBufferPool {
    pub fn new(config: ConnBufferConfig) -> Self {
        // SAFETY: sysconf is always callable.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert!(page_size.is_power_of_two());

        let mut pool = ConnBufferPool {
            config,
            page_size,
            free: BinaryHeap::new(),
            records: HashMap::new(),
            total_rsize: 0,
            total_rsize_in_freelist: 0,
            reclamation_in_progress: false,
            stats: ConnBufferStats::default(),
        };

        for _ in 0..pool.config.initial_count {
            if let Some(addr) = pool.map_buffer() {
                let max_rusage = pool.records[&addr].max_rusage;
                pool.free.push(FreeBuffer { max_rusage, addr });
                pool.total_rsize_in_freelist += max_rusage;
            }
        }
        pool
    }

    fn round_up_to_page(&self, bytes: usize) -> usize {
        (bytes + self.page_size - 1) & !(self.page_size - 1)
    }

    /// Map a fresh buffer, respecting the resident ceiling. Registers a
    /// record and returns the base address.
    fn map_buffer(&mut self) -> Option<usize> {
        if self.total_rsize + self.page_size >= self.config.total_rsize_top {
            return None;
        }

        // SAFETY: plain anonymous private mapping; no fd, no fixed addr.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.config.buffer_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!("conn buffer mmap failed");
            return None;
        }

        let addr = ptr as usize;
        let initial = self.round_up_to_page(1);
        self.records.insert(
            addr,
            BufferRecord {
                max_rusage: initial,
                prev_rusage: initial,
                rusage_updated: false,
            },
        );
        self.total_rsize += initial;
        Some(addr)
    }

    /// Unmap a buffer; in corruption-detection mode the vacated range is
    /// frozen `PROT_NONE` so stale pointers fault.
    fn destroy_buffer(&mut self, addr: usize) {
        let record = self
            .records
            .remove(&addr)
            .expect("destroying an unknown buffer");
        debug_assert!(self.total_rsize >= record.max_rusage);

        self.stats.destroys += 1;
        self.total_rsize -= record.max_rusage;

        // SAFETY: addr/len came from our own successful mmap.
        unsafe {
            libc::munmap(addr as *mut libc::c_void, self.config.buffer_size);
        }

        if self.config.detect_corruption {
            self.freeze_range(addr, record.max_rusage);
        }
    }

    /// Best-effort PROT_NONE remap of a vacated range; aborts the process
    /// if the address space cannot be pinned (continuing would defeat the
    /// detection mode).
    fn freeze_range(&self, addr: usize, range: usize) {
        let mut placed: Vec<(usize, usize)> = Vec::new();
        let mut success = false;

        for _ in 0..REMAP_ATTEMPTS {
            // SAFETY: PROT_NONE anonymous map; we never touch the memory.
            let remap = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    range,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if remap == libc::MAP_FAILED {
                break;
            }
            let got = remap as usize;
            if got == addr {
                success = true;
                break;
            }
            // overlapping placement would corrupt someone else's range
            if got < addr + range && addr < got + range {
                break;
            }
            placed.push((got, range));
        }

        for (got, len) in placed {
            // SAFETY: our own placements from the loop above.
            unsafe {
                libc::munmap(got as *mut libc::c_void, len);
            }
        }

        if !success {
            panic!("could not freeze vacated conn buffer range at {addr:#x}");
        }
    }

    /// Check out a buffer. The hint is accepted for interface parity with
    /// the heap ordering but does not influence selection.
    pub fn alloc(&mut self, _max_rusage_hint: usize) -> Option<ConnBuffer> {
        let addr = match self.free.pop() {
            Some(free) => {
                self.total_rsize_in_freelist -= free.max_rusage;
                free.addr
            }
            None => match self.map_buffer() {
                Some(addr) => addr,
                None => {
                    self.stats.allocs_failed += 1;
                    return None;
                }
            },
        };

        self.stats.allocs += 1;
        let record = self.records.get_mut(&addr).expect("record for live buffer");
        record.rusage_updated = false;
        record.prev_rusage = record.max_rusage;

        self.run_reclamation();

        Some(ConnBuffer {
            // SAFETY: mmap never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut u8) },
            len: self.config.buffer_size,
        })
    }

    /// Return a buffer. `reported_max` is the connection's view of how
    /// many bytes it actually used; `None` means "no idea", which assumes
    /// the worst unless usage was reported along the way.
    pub fn free(&mut self, buffer: ConnBuffer, reported_max: Option<usize>) {
        let addr = buffer.ptr.as_ptr() as usize;
        let (rec_max, rec_prev, rec_updated) = {
            let record = self.records.get(&addr).expect("freeing unknown buffer");
            (record.max_rusage, record.prev_rusage, record.rusage_updated)
        };

        let mut max_rusage = match reported_max {
            None if !rec_updated => self.config.buffer_size,
            None => rec_max,
            Some(reported) => reported,
        };
        max_rusage = self.round_up_to_page(max_rusage);
        if rec_max > max_rusage {
            max_rusage = rec_max;
        }

        self.stats.frees += 1;

        if max_rusage >= self.config.buffer_rsize_limit || self.config.detect_corruption {
            // never recycled: the unaccounted usage delta dies with the
            // buffer, so restore the last accounted figure first
            self.records
                .get_mut(&addr)
                .expect("record for live buffer")
                .max_rusage = rec_prev;
            self.destroy_buffer(addr);
        } else {
            self.records
                .get_mut(&addr)
                .expect("record for live buffer")
                .max_rusage = max_rusage;
            self.total_rsize += max_rusage - rec_prev;
            self.free.push(FreeBuffer { max_rusage, addr });
            self.total_rsize_in_freelist += max_rusage;
        }

        if !self.reclamation_in_progress && self.total_rsize >= self.config.total_rsize_top {
            debug!(total_rsize = self.total_rsize, "starting conn buffer reclamation");
            self.stats.reclamations_started += 1;
            self.reclamation_in_progress = true;
        }

        self.run_reclamation();
    }

    /// Record a connection's observed peak usage of a checked-out buffer.
    pub fn report_max_rusage(&mut self, buffer: &ConnBuffer, usage: usize) {
        let addr = buffer.ptr.as_ptr() as usize;
        let rounded = self.round_up_to_page(usage);
        let record = self.records.get_mut(&addr).expect("reporting unknown buffer");
        record.rusage_updated = true;
        if rounded > record.max_rusage {
            record.max_rusage = rounded;
        }
    }

    /// Destroy free buffers while reclamation is in progress, stopping at
    /// the bottom watermark or an empty free list.
    pub fn run_reclamation(&mut self) {
        while self.reclamation_in_progress {
            if let Some(free) = self.free.pop() {
                self.total_rsize_in_freelist -= free.max_rusage;
                self.destroy_buffer(free.addr);
            }

            if self.free.is_empty() || self.total_rsize <= self.config.total_rsize_bottom {
                self.reclamation_in_progress = false;
            }
        }
    }

    #[inline]
    pub fn total_rsize(&self) -> usize {
        self.total_rsize
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn total_rsize_in_freelist(&self) -> usize {
        self.total_rsize_in_freelist
    }

    #[inline]
    pub fn reclamation_in_progress(&self) -> bool {
        self.reclamation_in_progress
    }
}

impl Drop for ConnBufferPool {
    fn drop(&mut self) {
        let addrs: Vec<usize> = self.records.keys().copied().collect();
        for addr in addrs {
            self.records.remove(&addr);
            // SAFETY: our own mappings.
            unsafe {
                libc::munmap(addr as *mut libc::c_void, self.config.buffer_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ConnBufferConfig {
        ConnBufferConfig {
            buffer_size: 64 * 1024,
            initial_count: 2,
            buffer_rsize_limit: 32 * 1024,
            total_rsize_bottom: 64 * 1024,
            total_rsize_top: 256 * 1024,
            detect_corruption: false,
        }
    }

    #[test]
    fn test_alloc_free_recycles() {
        let mut pool = ConnBufferPool::new(small_config());
        assert_eq!(pool.free_count(), 2);

        let buffer = pool.alloc(0).unwrap();
        assert_eq!(pool.free_count(), 1);
        pool.free(buffer, Some(100));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.stats.allocs, 1);
        assert_eq!(pool.stats.frees, 1);
        assert_eq!(pool.stats.destroys, 0);
    }

    #[test]
    fn test_buffer_is_writable() {
        let mut pool = ConnBufferPool::new(small_config());
        let mut buffer = pool.alloc(0).unwrap();
        buffer.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&buffer.as_slice()[..5], b"hello");
        pool.free(buffer, Some(5));
    }

    #[test]
    fn test_peak_ordering_hands_out_hottest_first() {
        let mut pool = ConnBufferPool::new(small_config());
        let cold = pool.alloc(0).unwrap();
        let hot = pool.alloc(0).unwrap();
        let hot_addr = hot.as_ptr() as usize;

        pool.report_max_rusage(&hot, 16 * 1024);
        pool.free(cold, Some(100));
        pool.free(hot, Some(16 * 1024));

        let next = pool.alloc(0).unwrap();
        assert_eq!(next.as_ptr() as usize, hot_addr);
        pool.free(next, None);
    }

    #[test]
    fn test_limit_destroys_buffer() {
        let mut pool = ConnBufferPool::new(small_config());
        let buffer = pool.alloc(0).unwrap();
        pool.free(buffer, Some(32 * 1024));
        assert_eq!(pool.stats.destroys, 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_unreported_usage_assumes_worst() {
        let mut pool = ConnBufferPool::new(small_config());
        let buffer = pool.alloc(0).unwrap();
        // no report, no figure on free: assumed full-size, over the limit
        pool.free(buffer, None);
        assert_eq!(pool.stats.destroys, 1);
    }

    #[test]
    fn test_reclamation_hysteresis() {
        let mut config = small_config();
        config.buffer_rsize_limit = 64 * 1024; // don't destroy on free
        config.total_rsize_top = 128 * 1024;
        config.total_rsize_bottom = 16 * 1024;
        let mut pool = ConnBufferPool::new(config);

        // grow several buffers' accounted peaks past the top watermark
        let mut held = Vec::new();
        for _ in 0..4 {
            if let Some(buffer) = pool.alloc(0) {
                pool.report_max_rusage(&buffer, 48 * 1024);
                held.push(buffer);
            }
        }
        for buffer in held {
            pool.free(buffer, Some(48 * 1024));
        }

        assert!(pool.stats.reclamations_started >= 1);
        assert!(pool.stats.destroys >= 1);
        // hysteresis: once triggered, reclamation runs well below the top
        // watermark, not merely under it
        assert!(
            pool.total_rsize() < 128 * 1024,
            "resident size {} did not drop below the top watermark",
            pool.total_rsize()
        );
    }
}
