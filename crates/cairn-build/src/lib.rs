//! # cairn-build
//!
//! The cairn build engine: dependency-graph scheduling over a
//! content-addressable cache with fingerprint-based change detection.
//!
//! A build is declared as a [`Plan`] of named targets, each carrying a
//! command, dependencies, optional input files, and an optional seed.
//! The [`Executor`] validates the plan into a [`DependencyGraph`],
//! fingerprints every target, and then runs only what changed:
//!
//! - Targets whose fingerprint matches their latest ledger entry are
//!   skipped outright.
//! - Renamed targets whose fingerprint matches any historical entry
//!   are recovered from the cache without running their command.
//! - Everything else is dispatched to worker slots in parallel, in a
//!   deterministic topological order.
//!
//! Built values live in a content-addressed [`CacheStore`] keyed by
//! the SHA-256 of their bytes; provenance lives in an append-only
//! [`HistoryLedger`]. The [`RuntimePredictor`] estimates run duration
//! from ledger history, and [`QueryService`] exposes read-only access
//! to values, history, and statistics.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cairn_build::prelude::*;
//! use cairn_core::MemoryBackend;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cairn_build::Result<()> {
//! let plan = Plan::builder()
//!     .target(Target::new("data", "load()"))
//!     .target(Target::new("model", "fit(data)").dep("data"))
//!     .build()?;
//!
//! let executor = Executor::new(Arc::new(MemoryBackend::new()), BuildOptions::default());
//! let report = executor.execute(&plan, Arc::new(NoOpRunner)).await?;
//! assert!(report.succeeded());
//!
//! // Nothing changed, so a second run builds nothing.
//! let report = executor.execute(&plan, Arc::new(NoOpRunner)).await?;
//! assert_eq!(report.count(TargetStatus::SkippedUpToDate), 2);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod history;
pub mod memory;
pub mod metrics;
pub mod plan;
pub mod predict;
pub mod query;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod target;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use cairn_build::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cache::{CacheMetadata, CacheStore};
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::{Fingerprint, FingerprintEngine};
    pub use crate::graph::DependencyGraph;
    pub use crate::history::{HistoryLedger, LedgerEntry, LedgerIndex};
    pub use crate::memory::{DepValues, MemoryStrategy};
    pub use crate::plan::{Plan, PlanBuilder};
    pub use crate::predict::{RuntimePredictor, WorkerPool};
    pub use crate::query::QueryService;
    pub use crate::report::{RunReport, TargetOutcome, TargetStatus};
    pub use crate::runner::{BuildContext, FnRunner, NoOpRunner, Runner};
    pub use crate::scheduler::{BuildOptions, CancelHandle, Executor, WorkerSlotSpec};
    pub use crate::target::Target;
}

pub use cache::{CacheMetadata, CacheStore};
pub use error::{Error, Result};
pub use fingerprint::{CommandCanonicalizer, Fingerprint, FingerprintEngine, WhitespaceCanonicalizer};
pub use graph::DependencyGraph;
pub use history::{HistoryLedger, LedgerEntry, LedgerIndex};
pub use memory::{DepValues, MemoryManager, MemoryState, MemoryStrategy};
pub use plan::{Plan, PlanBuilder};
pub use predict::{RuntimePredictor, WorkerPool};
pub use query::{LedgerStats, QueryService, TargetStats};
pub use report::{RunReport, TargetOutcome, TargetStatus};
pub use runner::{BuildContext, FailingRunner, FnRunner, NoOpRunner, Runner};
pub use scheduler::{BuildOptions, CancelHandle, Executor, WorkerSlotSpec};
pub use target::Target;
