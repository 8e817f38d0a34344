//! Run reports.
//!
//! A [`RunReport`] is the serializable summary the scheduler returns:
//! one [`TargetOutcome`] per target, plus run-level identity and
//! timing. Outcomes are keyed by target name in a `BTreeMap`, so a
//! serialized report is deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, RunId};

use crate::fingerprint::Fingerprint;

/// Terminal state of one target within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// The command ran and the value was stored.
    Built,
    /// The latest ledger entry for this name matched the current
    /// fingerprint; nothing ran.
    SkippedUpToDate,
    /// A ledger entry under a different name matched the fingerprint;
    /// the artifact was adopted without running the command.
    Recovered,
    /// The command (or a cache operation scoped to this target) failed.
    Failed,
    /// A transitive dependency failed, so this target never ran.
    SkippedUpstreamFailure,
    /// The run was cancelled before this target was dispatched.
    Cancelled,
}

impl TargetStatus {
    /// Returns true if the target ended with a usable value.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Built | Self::SkippedUpToDate | Self::Recovered)
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Built => "built",
            Self::SkippedUpToDate => "skipped_up_to_date",
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::SkippedUpstreamFailure => "skipped_upstream_failure",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How one target fared in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    /// Terminal status.
    pub status: TargetStatus,
    /// Failure description, present only for failed targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock build time. Zero for skips; the original build's
    /// duration for recoveries.
    pub duration_ms: u64,
    /// Cache key of the target's value, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<ContentHash>,
    /// The fingerprint computed for this run, when planning got far
    /// enough to compute one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl TargetOutcome {
    pub(crate) fn skipped(status: TargetStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            duration_ms: 0,
            cache_key: None,
            fingerprint: None,
        }
    }
}

/// Summary of one build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: RunId,
    /// Digest of the plan that was executed.
    pub plan_digest: ContentHash,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the whole run.
    pub elapsed_ms: u64,
    /// Per-target outcomes, keyed by name.
    pub outcomes: BTreeMap<String, TargetOutcome>,
    /// Cache keys removed by post-run garbage collection, if it ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gc_removed: Vec<ContentHash>,
}

impl RunReport {
    /// Returns true if every target ended with a usable value.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcomes.values().all(|o| o.status.is_success())
    }

    /// Number of targets with the given status.
    #[must_use]
    pub fn count(&self, status: TargetStatus) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status == status)
            .count()
    }

    /// Names of targets with the given status, sorted.
    #[must_use]
    pub fn targets_with(&self, status: TargetStatus) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
