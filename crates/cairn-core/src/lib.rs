//! # cairn-core
//!
//! Core primitives for the cairn reproducible-computation build engine.
//!
//! This crate provides the foundational types used across all cairn
//! components:
//!
//! - **Identifiers**: Strongly-typed ULID ids for runs and ledger entries
//! - **Content Hashing**: SHA-256 hashes for cache keys and fingerprints
//! - **Canonical JSON**: Deterministic serialization for hashing
//! - **Storage Backend**: Abstract durable storage (memory, local disk)
//! - **Observability**: Structured-logging initialization and spans
//!
//! ## Crate Boundary
//!
//! `cairn-core` is the only crate allowed to define shared primitives.
//! The build engine (`cairn-build`) composes these; it never reaches
//! around them to the filesystem or a hasher directly.
//!
//! ## Example
//!
//! ```rust
//! use cairn_core::prelude::*;
//!
//! let run = RunId::generate();
//! let key = ContentHash::of(b"artifact bytes");
//! assert!(key.as_str().starts_with("sha256:"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod hash;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use cairn_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::hash::ContentHash;
    pub use crate::id::{EntryId, RunId};
    pub use crate::storage::{
        LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use canonical_json::{CanonicalJsonError, to_canonical_bytes, to_canonical_string};
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use id::{EntryId, RunId};
pub use observability::{LogFormat, init_logging};
pub use storage::{
    LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
