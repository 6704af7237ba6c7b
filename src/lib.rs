// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! # Flatcached
//!
//! In-memory key/value cache server of the memcached family: clients
//! issue binary-protocol commands over TCP or UDP, and the server stores
//! opaque byte values under short byte keys with explicit expiration,
//! LRU eviction, and a fixed memory budget.
//!
//! The crate is organized around the flat storage engine and the
//! connection/protocol machinery that feeds it:
//! - **[`storage`]** — page arena, chunk allocator, item manager, hash
//!   index, eviction and coalescing
//! - **[`conn`]** — connection state and the connection-buffer pool
//! - **[`proto`]** — binary wire codec, per-connection state machine,
//!   reply-header pool, UDP framing
//! - **[`server`]** — worker threads, dispatcher, timer, shared context
//! - **[`stats`]** — aggregate counters and the prefix-stats seam
//!
//! ## Example: embedding the engine
//!
//! ```rust
//! use flatcached::storage::{FlatStorage, StorageConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = StorageConfig::new(1024 * 1024);
//! config.grow_delta = 64 * 1024;
//! let mut cache = FlatStorage::new(config)?;
//!
//! let it = cache.item_alloc(b"greeting", 0, 0, 5 + 2, None, 1)?;
//! cache.prepare_value_receive(it);
//! # Ok(())
//! # }
//! ```
//!
//! ## Example: running the server
//!
//! ```rust,no_run
//! use flatcached::core::settings::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut settings = Settings::default();
//! settings.binary_port = 11212;
//! flatcached::server::run(settings)?;
//! # Ok(())
//! # }
//! ```

pub mod conn;
pub mod core;
pub mod proto;
pub mod server;
pub mod stats;
pub mod storage;

pub use crate::core::error::{CacheError, Result};
pub use crate::core::settings::Settings;
pub use crate::core::time::{Clock, RelTime};
pub use crate::server::{serve, Shared};
pub use crate::storage::{FlatStorage, StorageConfig};
