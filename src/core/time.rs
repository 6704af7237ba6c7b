// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Relative server time.
//!
//! All expiration bookkeeping runs on a monotonic `RelTime`: whole seconds
//! since the process started, bumped by the timer thread. Client-supplied
//! absolute expiration times (Unix epoch seconds) are rebased onto this
//! clock by [`Clock::realtime`], which mirrors the classic memcached rule:
//! values larger than [`REALTIME_MAXDELTA`] are epoch timestamps, smaller
//! values are relative offsets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds relative to process start. `0` doubles as "never expires".
pub type RelTime = u32;

/// Exptime values above this are interpreted as Unix epoch timestamps.
pub const REALTIME_MAXDELTA: u32 = 60 * 60 * 24 * 30;

/// Shared monotonic clock.
///
/// Cloning is cheap; all clones observe the same `current_time`. The timer
/// thread is the only writer.
#[derive(Clone)]
pub struct Clock {
    current: Arc<AtomicU32>,
    /// Unix epoch seconds at process start.
    started: u64,
}

impl Clock {
    /// Create a clock anchored at the current wall time, with
    /// `current_time` starting at 1 (0 is reserved for "never").
    pub fn new() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            current: Arc::new(AtomicU32::new(1)),
            started,
        }
    }

    /// Current relative time.
    #[inline]
    pub fn now(&self) -> RelTime {
        self.current.load(Ordering::Relaxed)
    }

    /// Advance the clock by one second. Called from the timer thread.
    #[inline]
    pub fn tick(&self) -> RelTime {
        self.current.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Advance the clock by `secs`. Test hook for time-dependent paths.
    pub fn advance(&self, secs: u32) -> RelTime {
        self.current.fetch_add(secs, Ordering::Relaxed) + secs
    }

    /// Unix epoch seconds at process start.
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Rebase a client-supplied exptime onto the relative clock.
    ///
    /// 0 stays 0 (never expires). Values beyond [`REALTIME_MAXDELTA`] are
    /// absolute epoch seconds; timestamps in the past collapse to an
    /// already-expired relative instant.
    pub fn realtime(&self, exptime: u32) -> RelTime {
        if exptime == 0 {
            return 0;
        }

        if exptime > REALTIME_MAXDELTA {
            let exptime = exptime as u64;
            if exptime <= self.started {
                // Past timestamps expire immediately, but nonzero so the
                // item does not become immortal.
                return self.now().saturating_sub(1).max(1);
            }
            (exptime - self.started) as RelTime
        } else {
            exptime + self.now()
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
