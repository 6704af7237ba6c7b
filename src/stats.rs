// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Aggregate server counters and the prefix-statistics seam.
//!
//! Counters shared across workers live in [`ServerStats`] behind the
//! stats lock; storage-engine counters live with the engine under the
//! cache lock and are merged into the rendered output. Rendering uses
//! the classic `STAT <name> <value>` text shape.

use serde::Serialize;

/// Aggregate counters guarded by the stats lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub curr_conns: u64,
    pub total_conns: u64,
    /// Connection structs ever created (recycled ones excluded).
    pub conn_structs: u64,
    pub get_cmds: u64,
    pub set_cmds: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub arith_cmds: u64,
    pub arith_hits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Collaborator interface for per-key-prefix statistics. The engine calls
/// these when `detail_enabled` is set; the bundled implementation is a
/// no-op, real bookkeeping lives outside this crate.
pub trait PrefixStats: Send + Sync {
    fn record_get(&self, key: &[u8], hit: bool);
    fn record_set(&self, key: &[u8]);
    fn record_delete(&self, key: &[u8]);
    fn record_removal(&self, key: &[u8], bytes: usize, last_access: u32, evicted: bool);
}

/// Default no-op prefix sink.
pub struct NullPrefixStats;

impl PrefixStats for NullPrefixStats {
    fn record_get(&self, _key: &[u8], _hit: bool) {}
    fn record_set(&self, _key: &[u8]) {}
    fn record_delete(&self, _key: &[u8]) {}
    fn record_removal(&self, _key: &[u8], _bytes: usize, _last_access: u32, _evicted: bool) {}
}

/// Append one `STAT name value` line.
pub fn stat_line(out: &mut String, name: &str, value: impl std::fmt::Display) {
    out.push_str("STAT ");
    out.push_str(name);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push_str("\r\n");
}

/// Terminate a stats body.
pub fn stat_end(out: &mut String) {
    out.push_str("END\r\n");
}
