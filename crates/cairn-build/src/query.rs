//! Read-only queries over the cache store and history ledger.
//!
//! Everything here works from a fresh ledger snapshot per call, so
//! queries see the results of any finished run without holding state
//! between calls.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, StorageBackend};

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::graph::DependencyGraph;
use crate::history::{HistoryLedger, LedgerEntry, LedgerIndex};
use crate::plan::Plan;
use crate::predict::{RuntimePredictor, WorkerPool};

/// Build statistics for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStats {
    /// Target name.
    pub target: String,
    /// Entries recorded for this name, recoveries included.
    pub entries: usize,
    /// How many of those were recoveries.
    pub recoveries: usize,
    /// When the latest entry was recorded.
    pub last_recorded_at: DateTime<Utc>,
    /// Duration of the latest entry.
    pub last_duration_ms: u64,
    /// Sum of all recorded durations for this name.
    pub total_duration_ms: u64,
    /// Cache key of the latest entry.
    pub latest_cache_key: ContentHash,
    /// Fingerprint of the latest entry.
    pub latest_fingerprint: Fingerprint,
}

/// Aggregate statistics over the whole ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    /// Total entries.
    pub entries: usize,
    /// Distinct target names.
    pub targets: usize,
    /// Entries recorded by recovery rather than execution.
    pub recovered_entries: usize,
    /// Distinct cache keys referenced.
    pub distinct_cache_keys: usize,
}

/// Read-only access to build provenance and cached values.
#[derive(Clone)]
pub struct QueryService {
    cache: CacheStore,
    ledger: HistoryLedger,
}

impl QueryService {
    /// Creates a query service over a storage backend shared with the
    /// executor.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            cache: CacheStore::new(Arc::clone(&backend)),
            ledger: HistoryLedger::new(backend),
        }
    }

    /// Fetches the latest built value for a target name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotFound`] if the ledger has no entry for
    /// the name, or a cache error if the value is gone.
    pub async fn value_by_name(&self, name: &str) -> Result<Bytes> {
        let index = self.index().await?;
        let entry = index
            .latest_for_target(name)
            .ok_or_else(|| Error::TargetNotFound {
                name: name.to_string(),
            })?;
        self.cache.get(&entry.cache_key).await
    }

    /// Fetches a value directly by its content hash.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the key is absent.
    pub async fn value_by_hash(&self, key: &ContentHash) -> Result<Bytes> {
        self.cache.get(key).await
    }

    /// Every ledger entry recorded for a target name, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn history_for_target(&self, name: &str) -> Result<Vec<LedgerEntry>> {
        let index = self.index().await?;
        Ok(index.entries_for_target(name).into_iter().cloned().collect())
    }

    /// Statistics for one target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotFound`] if the ledger has no entry for
    /// the name.
    pub async fn target_stats(&self, name: &str) -> Result<TargetStats> {
        let index = self.index().await?;
        let latest = index
            .latest_for_target(name)
            .ok_or_else(|| Error::TargetNotFound {
                name: name.to_string(),
            })?;
        let entries = index.entries_for_target(name);
        Ok(TargetStats {
            target: name.to_string(),
            entries: entries.len(),
            recoveries: entries.iter().filter(|e| e.recovered).count(),
            last_recorded_at: latest.recorded_at,
            last_duration_ms: latest.duration_ms,
            total_duration_ms: entries.iter().map(|e| e.duration_ms).sum(),
            latest_cache_key: latest.cache_key.clone(),
            latest_fingerprint: latest.fingerprint.clone(),
        })
    }

    /// Aggregate ledger statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn stats(&self) -> Result<LedgerStats> {
        let index = self.index().await?;
        let targets: HashSet<&str> = index.iter().map(|e| e.target.as_str()).collect();
        Ok(LedgerStats {
            entries: index.len(),
            targets: targets.len(),
            recovered_entries: index.iter().filter(|e| e.recovered).count(),
            distinct_cache_keys: index.all_cache_keys().len(),
        })
    }

    /// Predicts the wall-clock milliseconds of building a plan on the
    /// given pool, using ledger durations and assuming nothing is up to
    /// date.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan is invalid, the ledger cannot be
    /// read, or the pool cannot host every target.
    pub async fn predict(
        &self,
        plan: &Plan,
        pool: &WorkerPool,
        default_duration_ms: u64,
    ) -> Result<u64> {
        let graph = DependencyGraph::build(plan)?;
        let index = self.index().await?;
        let predictor =
            RuntimePredictor::new(index.duration_table()).default_duration_ms(default_duration_ms);
        predictor.predict(plan, &graph, pool, &HashSet::new())
    }

    async fn index(&self) -> Result<LedgerIndex> {
        Ok(LedgerIndex::from_entries(self.ledger.load().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::NoOpRunner;
    use crate::scheduler::{BuildOptions, Executor};
    use crate::target::Target;
    use cairn_core::MemoryBackend;

    async fn built_backend() -> (Arc<MemoryBackend>, Plan) {
        let backend = Arc::new(MemoryBackend::new());
        let plan = Plan::builder()
            .target(Target::new("data", "load()"))
            .target(Target::new("model", "fit(data)").dep("data"))
            .build()
            .expect("plan");
        let exec = Executor::new(backend.clone(), BuildOptions::default());
        exec.execute(&plan, Arc::new(NoOpRunner)).await.expect("run");
        (backend, plan)
    }

    #[tokio::test]
    async fn values_are_reachable_by_name_and_hash() {
        let (backend, _) = built_backend().await;
        let queries = QueryService::new(backend);

        let by_name = queries.value_by_name("model").await.expect("by name");
        assert_eq!(by_name, Bytes::from("fit(data)"));

        let key = ContentHash::of(&by_name);
        assert_eq!(queries.value_by_hash(&key).await.expect("by hash"), by_name);

        assert!(queries.value_by_name("stranger").await.is_err());
    }

    #[tokio::test]
    async fn history_and_stats_reflect_the_run() {
        let (backend, _) = built_backend().await;
        let queries = QueryService::new(backend);

        let history = queries.history_for_target("model").await.expect("history");
        assert_eq!(history.len(), 1);
        assert!(!history[0].recovered);

        let target = queries.target_stats("model").await.expect("stats");
        assert_eq!(target.entries, 1);
        assert_eq!(target.recoveries, 0);

        let all = queries.stats().await.expect("stats");
        assert_eq!(all.entries, 2);
        assert_eq!(all.targets, 2);
        assert_eq!(all.recovered_entries, 0);
    }

    #[tokio::test]
    async fn predict_uses_ledger_durations_with_default_fallback() {
        let (backend, plan) = built_backend().await;
        let queries = QueryService::new(backend);

        // Instant no-op builds recorded ~0ms durations, so the default
        // carries a plan with an unbuilt target.
        let extended = Plan::builder()
            .target(Target::new("data", "load()"))
            .target(Target::new("model", "fit(data)").dep("data"))
            .target(Target::new("report", "render(model)").dep("model"))
            .build()
            .expect("plan");
        let estimate = queries
            .predict(&extended, &WorkerPool::Uniform(1), 50)
            .await
            .expect("predict");
        assert!(estimate >= 50, "default duration must cover the new target");

        let known = queries
            .predict(&plan, &WorkerPool::Unbounded, 50)
            .await
            .expect("predict");
        assert!(known < 50, "built targets use measured durations");
    }
}
