// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Server configuration.
//!
//! [`Settings`] is the single configuration surface for the whole server.
//! It deserializes from a TOML file and is overridden field-by-field from
//! CLI flags by the binary. A few environment knobs exist purely for the
//! test harness.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::storage::chunk::LARGE_CHUNK_SIZE;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Seeds the item-storage-allocated stat; used by tests that compare
/// accounting across allocator back ends.
pub const ENV_INITIAL_MALLOC: &str = "T_MEMD_INITIAL_MALLOC";

/// Disables slab preallocation in the slab collaborator. The flat engine
/// reads it only to mirror the knob into [`Settings`].
pub const ENV_SLABS_ALLOC: &str = "T_MEMD_SLABS_ALLOC";

fn default_maxbytes() -> usize {
    64 * 1024 * 1024
}
fn default_maxconns() -> usize {
    1024
}
fn default_port() -> u16 {
    11211
}
fn default_binary_port() -> u16 {
    11212
}
fn default_interf() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_num_threads() -> usize {
    num_cpus::get()
}
fn default_evict_to_free() -> bool {
    true
}
fn default_chunk_size() -> usize {
    48
}
fn default_factor() -> f64 {
    1.25
}
fn default_max_conn_buffer_bytes() -> usize {
    16 * 1024 * 1024
}

/// Server settings, mirroring the classic option surface.
///
/// `port`, `udpport` and `socketpath` belong to the ASCII front end, which
/// is an external collaborator; they are accepted here so one config file
/// can drive both, but this crate only binds the binary surfaces.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Storage arena cap in bytes.
    pub maxbytes: usize,
    /// Soft cap on concurrent connections.
    pub maxconns: usize,
    /// ASCII-over-TCP port (external collaborator; 0 disables).
    pub port: u16,
    /// ASCII-over-UDP port (external collaborator; 0 disables).
    pub udpport: u16,
    /// Binary-over-TCP port (0 disables).
    pub binary_port: u16,
    /// Binary-over-UDP port (0 disables).
    pub binary_udpport: u16,
    /// Unix domain socket path (external collaborator).
    pub socketpath: Option<PathBuf>,
    /// Interface to bind.
    pub interf: Ipv4Addr,
    /// Verbosity 0..2.
    pub verbose: u8,
    /// Worker thread count.
    pub num_threads: usize,
    /// Evict on memory exhaustion rather than failing the store.
    pub evict_to_free: bool,
    /// Virtual-bucket routing (reserved, not implemented here).
    pub managed: bool,
    /// Slab allocator minimum chunk size (collaborator tuning).
    pub chunk_size: usize,
    /// Slab allocator growth factor (collaborator tuning).
    pub factor: f64,
    /// Enable per-prefix statistics collaborator.
    pub detail_enabled: bool,
    /// Connection-buffer pool resident ceiling.
    pub max_conn_buffer_bytes: usize,
    /// Slab preallocation disabled (from T_MEMD_SLABS_ALLOC).
    #[serde(skip)]
    pub slabs_prealloc_disabled: bool,
    /// Bind the TCP surface on an ephemeral port regardless of
    /// `binary_port`; harness hook for tests that cannot pick ports.
    #[serde(skip)]
    pub bind_ephemeral: bool,
    /// Stat seed (from T_MEMD_INITIAL_MALLOC).
    #[serde(skip)]
    pub initial_malloc_seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            maxbytes: default_maxbytes(),
            maxconns: default_maxconns(),
            port: default_port(),
            udpport: 0,
            binary_port: default_binary_port(),
            binary_udpport: 0,
            socketpath: None,
            interf: default_interf(),
            verbose: 0,
            num_threads: default_num_threads(),
            evict_to_free: default_evict_to_free(),
            managed: false,
            chunk_size: default_chunk_size(),
            factor: default_factor(),
            detail_enabled: false,
            max_conn_buffer_bytes: default_max_conn_buffer_bytes(),
            slabs_prealloc_disabled: false,
            bind_ephemeral: false,
            initial_malloc_seed: 0,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, then apply environment knobs.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let text = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            SettingsError::Read {
                path: path_str.clone(),
                source,
            }
        })?;
        let mut settings: Settings =
            toml::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path_str,
                source,
            })?;
        settings.apply_env();
        Ok(settings)
    }

    /// Pull the test-harness environment knobs into the settings.
    pub fn apply_env(&mut self) {
        if let Ok(seed) = std::env::var(ENV_INITIAL_MALLOC) {
            self.initial_malloc_seed = seed.parse().unwrap_or(0);
        }
        if std::env::var(ENV_SLABS_ALLOC).is_ok() {
            self.slabs_prealloc_disabled = true;
        }
    }

    /// Validate field combinations that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.maxbytes == 0 || self.maxbytes % LARGE_CHUNK_SIZE != 0 {
            return Err(SettingsError::Invalid(format!(
                "maxbytes must be a nonzero multiple of {LARGE_CHUNK_SIZE}, got {}",
                self.maxbytes
            )));
        }
        if self.num_threads == 0 {
            return Err(SettingsError::Invalid(
                "num_threads must be at least 1".to_string(),
            ));
        }
        if self.verbose > 2 {
            return Err(SettingsError::Invalid(format!(
                "verbose must be 0..2, got {}",
                self.verbose
            )));
        }
        if self.binary_port == 0 && self.binary_udpport == 0 && !self.bind_ephemeral {
            return Err(SettingsError::Invalid(
                "at least one of binary_port / binary_udpport must be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.binary_port, 11212);
        assert!(settings.evict_to_free);
    }

    #[test]
    fn test_parse_toml() {
        let settings: Settings = toml::from_str(
            r#"
            maxbytes = 4194304
            binary_port = 9999
            num_threads = 2
            verbose = 1
            "#,
        )
        .unwrap();
        assert_eq!(settings.maxbytes, 4 * 1024 * 1024);
        assert_eq!(settings.binary_port, 9999);
        assert_eq!(settings.num_threads, 2);
        settings.validate().unwrap();
    }

    #[test]
    fn test_rejects_unaligned_maxbytes() {
        let mut settings = Settings::default();
        settings.maxbytes = 1000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_no_listeners() {
        let mut settings = Settings::default();
        settings.binary_port = 0;
        settings.binary_udpport = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_field() {
        let parsed: Result<Settings, _> = toml::from_str("no_such_option = 1");
        assert!(parsed.is_err());
    }
}
