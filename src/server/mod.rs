// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Server orchestration: the shared context, worker/dispatcher/timer
//! threads, and the stats surface.
//!
//! Locking discipline: `storage` is the cache lock (index, LRUs, chunk
//! state, refcounts), `stats` the aggregate-counter lock, `buffers` the
//! pool lock. A thread holds at most one of them at a time, and none
//! across a syscall. Connection structs recycle through a lock-free
//! queue.

pub mod dispatch;
pub mod event;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::conn::buffer_pool::{ConnBufferConfig, ConnBufferPool};
use crate::conn::ConnFreeList;
use crate::core::error::Result;
use crate::core::settings::Settings;
use crate::core::time::Clock;
use crate::stats::{self, PrefixStats, ServerStats};
use crate::storage::chunk::{ChunkKind, LARGE_CHUNK_SIZE};
use crate::storage::{FlatStorage, StorageConfig};

/// Set by the SIGINT handler; merged into every shutdown check.
static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGINT handling and neutralize SIGPIPE (peer resets surface as
/// EPIPE on the write path instead of killing the process).
pub fn install_signal_handlers() {
    // SAFETY: handler only touches an atomic; SIG_IGN is a constant.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Stable view of the arena base for building iovecs outside the cache
/// lock. Offsets come from item segments whose refcounts the connection
/// holds; the pinning rule in `storage::table` keeps them valid.
#[derive(Clone, Copy)]
pub struct ArenaView {
    base: *const u8,
}

// SAFETY: the base pointer is immutable for the process lifetime; all
// dereferences go through raw pointers handed to the kernel, gated by the
// refcount pinning rule.
unsafe impl Send for ArenaView {}
unsafe impl Sync for ArenaView {}

impl ArenaView {
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        // SAFETY: offsets come from segment walks over initialized chunks.
        unsafe { self.base.add(offset) }
    }

    #[inline]
    pub fn mut_ptr_at(&self, offset: usize) -> *mut u8 {
        self.ptr_at(offset) as *mut u8
    }
}

/// Everything the workers share.
pub struct Shared {
    pub settings: Settings,
    pub clock: Clock,
    /// The cache lock.
    pub storage: Mutex<FlatStorage>,
    /// The stats lock.
    pub stats: Mutex<ServerStats>,
    /// The connection-buffer pool lock.
    pub buffers: Mutex<ConnBufferPool>,
    pub conn_free: ConnFreeList,
    pub arena: ArenaView,
    pub prefix_stats: Option<Arc<dyn PrefixStats>>,
    shutdown: AtomicBool,
    /// Actual TCP port after binding (useful with ephemeral binds).
    pub bound_tcp_port: AtomicU16,
    /// Actual UDP port after binding.
    pub bound_udp_port: AtomicU16,
}

impl Shared {
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let mut storage_config = StorageConfig::new(settings.maxbytes);
        storage_config.evict_to_free = settings.evict_to_free;
        let mut storage = FlatStorage::new(storage_config)?;
        storage.stats.storage_allocated += settings.initial_malloc_seed;

        let arena = ArenaView {
            base: storage.base_ptr(),
        };

        let buffers = ConnBufferPool::new(ConnBufferConfig::with_ceiling(
            settings.max_conn_buffer_bytes,
        ));

        let conn_free = ConnFreeList::new(settings.maxconns);

        Ok(Arc::new(Shared {
            clock: Clock::new(),
            storage: Mutex::new(storage),
            stats: Mutex::new(ServerStats::default()),
            buffers: Mutex::new(buffers),
            conn_free,
            arena,
            prefix_stats: None,
            shutdown: AtomicBool::new(false),
            bound_tcp_port: AtomicU16::new(0),
            bound_udp_port: AtomicU16::new(0),
            settings,
        }))
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || SIGNAL_SHUTDOWN.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Render the stats text for a section of the stats command.
    pub fn stats_text(&self, section: &str) -> String {
        match section {
            "" => self.general_stats(),
            "allocator" => self.allocator_stats(),
            "sizes" => self.storage.lock().unwrap().stats_sizes(),
            "buffers" => self.buffer_stats(),
            "items small" => self.storage.lock().unwrap().cachedump(ChunkKind::Small, 0),
            "items large" => self.storage.lock().unwrap().cachedump(ChunkKind::Large, 0),
            "json" => self.json_stats(),
            _ => "END\r\n".to_string(),
        }
    }

    /// Machine-readable snapshot of the server and storage counters.
    fn json_stats(&self) -> String {
        let storage_stats = self.storage.lock().unwrap().stats.clone();
        let server = self.stats.lock().unwrap().clone();
        serde_json::json!({
            "uptime": self.clock.now(),
            "server": server,
            "storage": storage_stats,
        })
        .to_string()
    }

    fn general_stats(&self) -> String {
        let now = self.clock.now();
        let started = chrono::DateTime::from_timestamp(self.clock.started() as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let (storage_stats, curr_items) = {
            let storage = self.storage.lock().unwrap();
            (storage.stats.clone(), storage.curr_items())
        };
        let server = self.stats.lock().unwrap().clone();

        let mut out = String::new();
        stats::stat_line(&mut out, "version", env!("CARGO_PKG_VERSION"));
        stats::stat_line(&mut out, "uptime", now);
        stats::stat_line(&mut out, "time", self.clock.started() + now as u64);
        stats::stat_line(&mut out, "started", started);
        stats::stat_line(&mut out, "curr_items", curr_items);
        stats::stat_line(&mut out, "total_items", storage_stats.total_items);
        stats::stat_line(&mut out, "bytes", storage_stats.item_total_size);
        stats::stat_line(&mut out, "evictions", storage_stats.evictions);
        stats::stat_line(&mut out, "expirations", storage_stats.expirations);
        stats::stat_line(
            &mut out,
            "item_storage_allocated",
            storage_stats.storage_allocated,
        );
        stats::stat_line(&mut out, "limit_maxbytes", self.settings.maxbytes);
        stats::stat_line(&mut out, "curr_connections", server.curr_conns);
        stats::stat_line(&mut out, "total_connections", server.total_conns);
        stats::stat_line(&mut out, "connection_structures", server.conn_structs);
        stats::stat_line(&mut out, "cmd_get", server.get_cmds);
        stats::stat_line(&mut out, "cmd_set", server.set_cmds);
        stats::stat_line(&mut out, "get_hits", server.get_hits);
        stats::stat_line(&mut out, "get_misses", server.get_misses);
        stats::stat_line(&mut out, "arith_cmds", server.arith_cmds);
        stats::stat_line(&mut out, "arith_hits", server.arith_hits);
        stats::stat_line(&mut out, "bytes_read", server.bytes_read);
        stats::stat_line(&mut out, "bytes_written", server.bytes_written);
        stats::stat_line(&mut out, "threads", self.settings.num_threads);
        stats::stat_end(&mut out);
        out
    }

    fn allocator_stats(&self) -> String {
        let storage = self.storage.lock().unwrap();
        let stats_snapshot = storage.stats.clone();

        let mut out = String::new();
        stats::stat_line(
            &mut out,
            "large_title_chunks",
            stats_snapshot.large_title_chunks,
        );
        stats::stat_line(
            &mut out,
            "large_body_chunks",
            stats_snapshot.large_body_chunks,
        );
        stats::stat_line(
            &mut out,
            "large_broken_chunks",
            stats_snapshot.large_broken_chunks,
        );
        stats::stat_line(
            &mut out,
            "small_title_chunks",
            stats_snapshot.small_title_chunks,
        );
        stats::stat_line(
            &mut out,
            "small_body_chunks",
            stats_snapshot.small_body_chunks,
        );
        for (bucket, count) in stats_snapshot.broken_chunk_histogram.iter().enumerate() {
            stats::stat_line(
                &mut out,
                &format!("broken_chunk_histogram {bucket}"),
                count,
            );
        }
        stats::stat_line(&mut out, "break_events", stats_snapshot.break_events);
        stats::stat_line(&mut out, "unbreak_events", stats_snapshot.unbreak_events);
        stats::stat_line(&mut out, "migrates", stats_snapshot.migrates);
        stats::stat_line(
            &mut out,
            "unused_memory",
            storage.table().arena().unused_bytes(),
        );
        stats::stat_line(&mut out, "large_free_list_sz", storage.large_free_count());
        stats::stat_line(&mut out, "small_free_list_sz", storage.small_free_count());
        stats::stat_end(&mut out);
        out
    }

    fn buffer_stats(&self) -> String {
        let buffers = self.buffers.lock().unwrap();
        let snapshot = buffers.stats;

        let mut out = String::new();
        stats::stat_line(&mut out, "num_free_buffers", buffers.free_count());
        stats::stat_line(&mut out, "total_rsize", buffers.total_rsize());
        stats::stat_line(
            &mut out,
            "total_rsize_in_freelist",
            buffers.total_rsize_in_freelist(),
        );
        stats::stat_line(&mut out, "allocates", snapshot.allocs);
        stats::stat_line(&mut out, "frees", snapshot.frees);
        stats::stat_line(&mut out, "failed_allocates", snapshot.allocs_failed);
        stats::stat_line(&mut out, "destroys", snapshot.destroys);
        stats::stat_line(
            &mut out,
            "reclamations_started",
            snapshot.reclamations_started,
        );
        stats::stat_end(&mut out);
        out
    }
}

/// Timer thread: bumps `current_time` once per second and runs the
/// periodic hygiene that belongs between request phases.
fn timer_loop(shared: Arc<Shared>) {
    let mut elapsed = Duration::ZERO;
    const STEP: Duration = Duration::from_millis(100);

    while !shared.is_shutdown() {
        std::thread::sleep(STEP);
        elapsed += STEP;
        if elapsed < Duration::from_secs(1) {
            continue;
        }
        elapsed = Duration::ZERO;

        let now = shared.clock.tick();
        {
            let mut storage = shared.storage.lock().unwrap();
            storage.run_deferred_deletes(now);
            storage.move_next_bucket();
        }
        shared.buffers.lock().unwrap().run_reclamation();
    }
    debug!("timer thread down");
}

/// Run the server to completion: workers, timer, and the dispatcher on
/// the calling thread. Returns after shutdown is requested (or SIGINT).
pub fn serve(shared: Arc<Shared>) -> Result<()> {
    info!(
        maxbytes = shared.settings.maxbytes,
        threads = shared.settings.num_threads,
        "starting flatcached (arena of {} large chunks)",
        shared.settings.maxbytes / LARGE_CHUNK_SIZE
    );

    let mut workers = Vec::with_capacity(shared.settings.num_threads);
    for id in 0..shared.settings.num_threads {
        workers.push(worker::spawn_worker(id, Arc::clone(&shared))?);
    }

    let timer = {
        let shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || timer_loop(shared))?
    };

    let result = dispatch::run_dispatcher(&shared, &workers);

    // dispatcher returned: shutdown in progress
    shared.request_shutdown();
    for handle in workers {
        event::notify(handle.notify_send);
        let _ = handle.join.join();
        event::close(handle.notify_send);
    }
    let _ = timer.join();

    info!("flatcached stopped");
    result
}

/// Convenience entry point: build the shared context and serve.
pub fn run(settings: Settings) -> Result<()> {
    let shared = Shared::new(settings)?;
    serve(shared)
}
