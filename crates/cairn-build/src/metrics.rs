//! Build engine metrics.
//!
//! Emitted through the `metrics` facade; binaries choose the exporter.
//! Metric names are stable and prefixed `cairn_build_`.

use crate::report::TargetStatus;

/// Counter: targets finished, labeled by terminal status.
pub const TARGETS_TOTAL: &str = "cairn_build_targets_total";

/// Histogram: wall-clock duration of executed target builds.
pub const TARGET_DURATION_MS: &str = "cairn_build_target_duration_ms";

/// Histogram: wall-clock duration of whole runs.
pub const RUN_DURATION_MS: &str = "cairn_build_run_duration_ms";

/// Counter: cache entries removed by garbage collection.
pub const GC_REMOVED_TOTAL: &str = "cairn_build_gc_removed_total";

/// Gauge: values resident in memory after a build step.
pub const MEMORY_RESIDENT_VALUES: &str = "cairn_build_memory_resident_values";

pub(crate) fn record_target(status: TargetStatus, duration_ms: u64) {
    metrics::counter!(TARGETS_TOTAL, "status" => status.to_string()).increment(1);
    if matches!(status, TargetStatus::Built) {
        #[allow(clippy::cast_precision_loss)]
        metrics::histogram!(TARGET_DURATION_MS).record(duration_ms as f64);
    }
}

pub(crate) fn record_run(elapsed_ms: u64) {
    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!(RUN_DURATION_MS).record(elapsed_ms as f64);
}

pub(crate) fn record_gc(removed: usize) {
    metrics::counter!(GC_REMOVED_TOTAL).increment(removed as u64);
}

pub(crate) fn record_resident(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(MEMORY_RESIDENT_VALUES).set(count as f64);
}
