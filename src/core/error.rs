// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Core error types for flatcached.
//!
//! Provides error types for cache and server operations:
//! - Item sizing and storage exhaustion
//! - Semantic command results surfaced as errors
//! - Protocol framing violations
//! - Buffer-pool exhaustion

use std::fmt;

/// Errors that can occur during cache and protocol operations.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Key or value exceeds the permitted size
    SizeInvalid {
        /// Key length requested
        nkey: usize,
        /// Value length requested
        nbytes: usize,
    },

    /// Every allocation strategy failed to free enough chunks
    OutOfMemory {
        /// Chunks that were needed
        chunks_needed: usize,
    },

    /// The backing arena could not be reserved at startup
    OutOfAddressSpace {
        /// Bytes requested from the OS
        requested: usize,
        /// Underlying error message
        reason: String,
    },

    /// The item is delete-locked and its window has not elapsed
    DeleteLocked,

    /// Key not present in the index
    NotFound,

    /// Store predicate failed (add on present key, replace on absent key)
    NotStored,

    /// incr/decr applied to a value that does not parse as a decimal number
    NumericParse {
        /// What went wrong
        reason: String,
    },

    /// incr/decr applied to a decimal value that does not fit the
    /// numeric range
    NumericRange {
        /// What went wrong
        reason: String,
    },

    /// Protocol framing error (bad magic, unknown command)
    Protocol {
        /// Context (e.g. "request header", "udp prefix")
        context: String,
        /// Error message
        message: String,
    },

    /// UDP request split across datagrams
    UdpFragmentation,

    /// The connection-buffer pool could not supply a buffer
    BufferExhausted,

    /// Internal consistency check failure
    InvariantViolation {
        /// Description of the invariant that was violated
        invariant: String,
    },

    /// I/O error from the OS
    Io(String),
}

impl CacheError {
    /// Create a size-invalid error.
    pub fn size_invalid(nkey: usize, nbytes: usize) -> Self {
        CacheError::SizeInvalid { nkey, nbytes }
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(chunks_needed: usize) -> Self {
        CacheError::OutOfMemory { chunks_needed }
    }

    /// Create an out-of-address-space error.
    pub fn out_of_address_space(requested: usize, reason: impl Into<String>) -> Self {
        CacheError::OutOfAddressSpace {
            requested,
            reason: reason.into(),
        }
    }

    /// Create a numeric-parse error.
    pub fn numeric_parse(reason: impl Into<String>) -> Self {
        CacheError::NumericParse {
            reason: reason.into(),
        }
    }

    /// Create a numeric-range error.
    pub fn numeric_range(reason: impl Into<String>) -> Self {
        CacheError::NumericRange {
            reason: reason.into(),
        }
    }

    /// Create a protocol framing error.
    pub fn protocol(context: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Protocol {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an invariant violation error.
    pub fn invariant_violation(invariant: impl Into<String>) -> Self {
        CacheError::InvariantViolation {
            invariant: invariant.into(),
        }
    }

    /// Get structured fields for logging.
    pub fn log_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            CacheError::SizeInvalid { nkey, nbytes } => vec![
                ("nkey", nkey.to_string()),
                ("nbytes", nbytes.to_string()),
            ],
            CacheError::OutOfMemory { chunks_needed } => {
                vec![("chunks_needed", chunks_needed.to_string())]
            }
            CacheError::OutOfAddressSpace { requested, reason } => vec![
                ("requested", requested.to_string()),
                ("reason", reason.clone()),
            ],
            CacheError::DeleteLocked => vec![],
            CacheError::NotFound => vec![],
            CacheError::NotStored => vec![],
            CacheError::NumericParse { reason } => vec![("reason", reason.clone())],
            CacheError::NumericRange { reason } => vec![("reason", reason.clone())],
            CacheError::Protocol { context, message } => {
                vec![("context", context.clone()), ("message", message.clone())]
            }
            CacheError::UdpFragmentation => vec![],
            CacheError::BufferExhausted => vec![],
            CacheError::InvariantViolation { invariant } => {
                vec![("invariant", invariant.clone())]
            }
            CacheError::Io(msg) => vec![("message", msg.clone())],
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::SizeInvalid { nkey, nbytes } => {
                write!(f, "Invalid item size: nkey={nkey}, nbytes={nbytes}")
            }
            CacheError::OutOfMemory { chunks_needed } => {
                write!(f, "Out of memory: could not free {chunks_needed} chunks")
            }
            CacheError::OutOfAddressSpace { requested, reason } => {
                write!(f, "Could not reserve {requested} bytes of address space: {reason}")
            }
            CacheError::DeleteLocked => write!(f, "Item is delete-locked"),
            CacheError::NotFound => write!(f, "Not found"),
            CacheError::NotStored => write!(f, "Not stored"),
            CacheError::NumericParse { reason } => {
                write!(f, "Cannot apply arithmetic: {reason}")
            }
            CacheError::NumericRange { reason } => {
                write!(f, "Arithmetic value out of range: {reason}")
            }
            CacheError::Protocol { context, message } => {
                write!(f, "Protocol error in {context}: {message}")
            }
            CacheError::UdpFragmentation => {
                write!(f, "UDP requests cannot be split across datagrams")
            }
            CacheError::BufferExhausted => write!(f, "Connection-buffer pool exhausted"),
            CacheError::InvariantViolation { invariant } => {
                write!(f, "Invariant violation: {invariant}")
            }
            CacheError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Result type for flatcached operations.
pub type Result<T> = std::result::Result<T, CacheError>;
