//! Error types for the build engine.
//!
//! The taxonomy separates fatal errors (plan-level problems that stop
//! the whole run before or during execution) from target-scoped errors
//! (one target fails, its dependents are skipped, siblings continue):
//!
//! - Fatal: graph validation, scheduling deadlock, cache consistency
//! - Target-scoped: build failures, cache IO exhausted after retries
//! - Fingerprint errors surface during planning and are fatal there

/// The result type used throughout cairn-build.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in build-engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The cycle path, first node repeated at the end.
        cycle: Vec<String>,
    },

    /// Two targets were declared with the same name.
    #[error("duplicate target name: {name}")]
    DuplicateTarget {
        /// The duplicated name.
        name: String,
    },

    /// A target depends on a name that no target declares.
    #[error("target '{target}' depends on unknown target '{dependency}'")]
    DanglingDependency {
        /// The target whose dependency list is broken.
        target: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Two targets declare the same output file.
    #[error("targets '{first}' and '{second}' both declare output '{path}'")]
    DuplicateOutput {
        /// The contested output path.
        path: String,
        /// First declaring target (plan order).
        first: String,
        /// Second declaring target (plan order).
        second: String,
    },

    /// Fingerprint computation failed for a target.
    #[error("fingerprint error for target '{target}': {message}")]
    Fingerprint {
        /// The target being fingerprinted.
        target: String,
        /// Description of the failure.
        message: String,
    },

    /// A cache key already holds different bytes than the ones being
    /// written. Content-addressing is foundational; this always aborts
    /// the run.
    #[error("cache consistency violation: key {key} already holds different content")]
    CacheConsistency {
        /// The colliding cache key.
        key: String,
    },

    /// A cache storage operation failed after bounded retries.
    #[error("cache IO error on {key}: {message}")]
    CacheIo {
        /// The cache key being accessed.
        key: String,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A target's command failed. Always target-scoped.
    #[error("build of target '{target}' failed: {message}")]
    Build {
        /// The target that failed.
        target: String,
        /// Description of the failure.
        message: String,
    },

    /// The scheduler cannot make progress (unsatisfiable worker
    /// affinity). Fatal to the whole run.
    #[error("scheduling error: {message}")]
    Scheduling {
        /// Description of the deadlock.
        message: String,
    },

    /// A target name was not found in the plan or ledger.
    #[error("target not found: {name}")]
    TargetNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from cairn-core.
    #[error("core error: {0}")]
    Core(#[from] cairn_core::Error),
}

impl Error {
    /// Creates a target-scoped build error.
    #[must_use]
    pub fn build(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Build {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a scheduling error.
    #[must_use]
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling {
            message: message.into(),
        }
    }

    /// Returns true if this error must abort the entire run rather than
    /// fail a single target.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::DuplicateTarget { .. }
                | Self::DanglingDependency { .. }
                | Self::DuplicateOutput { .. }
                | Self::CacheConsistency { .. }
                | Self::Scheduling { .. }
        )
    }
}

impl From<cairn_core::CanonicalJsonError> for Error {
    fn from(e: cairn_core::CanonicalJsonError) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
