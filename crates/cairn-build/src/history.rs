//! Append-only history ledger.
//!
//! The ledger records one entry per completed build (or recovery):
//! which target, under which fingerprint, produced which cache key,
//! when, and how long it took. It is the source of truth for
//! up-to-date checks, recovery matching, duration statistics, and
//! provenance queries.
//!
//! Entries are written as one JSON object per entry at
//! `ledger/{entry_id}.json`, using a `DoesNotExist` precondition so
//! duplicate deliveries are no-ops. Entry ids are ULIDs, so a sorted
//! listing of the ledger directory is the append order. Entries are
//! never deleted by normal builds; only [`HistoryLedger::purge`]
//! removes them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, EntryId, RunId, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// One build record in the history ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Unique entry identifier; doubles as the storage key and encodes
    /// append order.
    pub entry_id: EntryId,
    /// The run that produced this entry.
    pub run_id: RunId,
    /// Target name at the time of the build.
    pub target: String,
    /// The target's fingerprint when built.
    pub fingerprint: Fingerprint,
    /// Content hash of the built value in the cache store.
    pub cache_key: ContentHash,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Build duration. Recovered entries carry the original build's
    /// duration so the predictor keeps a realistic estimate.
    pub duration_ms: u64,
    /// Seed used, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// True if this entry was adopted from history rather than built.
    #[serde(default)]
    pub recovered: bool,
}

/// Durable, append-only ledger over a [`StorageBackend`].
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct HistoryLedger {
    backend: Arc<dyn StorageBackend>,
}

impl HistoryLedger {
    /// Creates a ledger over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn entry_path(id: EntryId) -> String {
        format!("ledger/{id}.json")
    }

    /// Appends an entry to the ledger.
    ///
    /// Idempotent: a duplicate entry id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the storage write fails.
    #[tracing::instrument(
        skip(self, entry),
        fields(entry_id = %entry.entry_id, target = %entry.target, fingerprint = %entry.fingerprint)
    )]
    pub async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let json = serde_json::to_vec(entry).map_err(|e| Error::Serialization {
            message: format!("failed to serialize ledger entry: {e}"),
        })?;

        let result = self
            .backend
            .put(
                &Self::entry_path(entry.entry_id),
                Bytes::from(json),
                WritePrecondition::DoesNotExist,
            )
            .await
            .map_err(Error::Core)?;

        match result {
            WriteResult::Success => {
                tracing::debug!("ledger entry written");
            }
            WriteResult::PreconditionFailed => {
                tracing::debug!("duplicate ledger entry delivery - no-op");
            }
        }
        Ok(())
    }

    /// Loads every entry, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing, a read, or deserialization
    /// fails.
    pub async fn load(&self) -> Result<Vec<LedgerEntry>> {
        let metas = self.backend.list("ledger/").await.map_err(Error::Core)?;
        let mut entries = Vec::with_capacity(metas.len());
        for meta in metas {
            let bytes = self.backend.get(&meta.path).await.map_err(Error::Core)?;
            let entry: LedgerEntry =
                serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
                    message: format!("corrupt ledger entry at {}: {e}", meta.path),
                })?;
            entries.push(entry);
        }
        // Listing is path-sorted and ULIDs sort by creation time, but
        // sort again so clock skew between processes cannot reorder
        // recovery decisions.
        entries.sort_by(|a, b| (a.recorded_at, a.entry_id).cmp(&(b.recorded_at, b.entry_id)));
        Ok(entries)
    }

    /// Removes every ledger entry. Explicit provenance destruction;
    /// never called by normal builds.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing or a delete fails.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self) -> Result<usize> {
        let metas = self.backend.list("ledger/").await.map_err(Error::Core)?;
        let count = metas.len();
        for meta in metas {
            self.backend.delete(&meta.path).await.map_err(Error::Core)?;
        }
        tracing::info!(purged = count, "history ledger purged");
        Ok(count)
    }
}

/// In-memory index over a loaded ledger snapshot.
///
/// The scheduler loads the ledger once per run and appends to both the
/// durable ledger and this index as targets complete, so queries never
/// re-read storage mid-run.
#[derive(Debug, Default)]
pub struct LedgerIndex {
    entries: Vec<LedgerEntry>,
    latest_by_target: HashMap<String, usize>,
    by_fingerprint: HashMap<Fingerprint, Vec<usize>>,
}

impl LedgerIndex {
    /// Builds an index from entries in append order.
    #[must_use]
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    /// Adds an entry to the index.
    pub fn insert(&mut self, entry: LedgerEntry) {
        let pos = self.entries.len();

        let is_newer = match self
            .latest_by_target
            .get(&entry.target)
            .and_then(|&i| self.entries.get(i))
        {
            Some(e) => (entry.recorded_at, entry.entry_id) >= (e.recorded_at, e.entry_id),
            None => true,
        };
        if is_newer {
            self.latest_by_target.insert(entry.target.clone(), pos);
        }

        self.by_fingerprint
            .entry(entry.fingerprint.clone())
            .or_default()
            .push(pos);
        self.entries.push(entry);
    }

    /// Latest entry recorded for the given target name.
    #[must_use]
    pub fn latest_for_target(&self, target: &str) -> Option<&LedgerEntry> {
        self.latest_by_target
            .get(target)
            .and_then(|&i| self.entries.get(i))
    }

    /// Most recent entry with the given fingerprint, under any name.
    /// Ties on timestamp break by entry id.
    #[must_use]
    pub fn latest_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&LedgerEntry> {
        self.by_fingerprint
            .get(fingerprint)?
            .iter()
            .filter_map(|&i| self.entries.get(i))
            .max_by_key(|e| (e.recorded_at, e.entry_id))
    }

    /// All entries for a target, in append order.
    #[must_use]
    pub fn entries_for_target(&self, target: &str) -> Vec<&LedgerEntry> {
        self.entries.iter().filter(|e| e.target == target).collect()
    }

    /// Latest measured duration per target, for the predictor.
    #[must_use]
    pub fn duration_table(&self) -> BTreeMap<String, u64> {
        self.latest_by_target
            .iter()
            .filter_map(|(name, &i)| self.entries.get(i).map(|e| (name.clone(), e.duration_ms)))
            .collect()
    }

    /// Every cache key any entry references (history-retention GC set).
    #[must_use]
    pub fn all_cache_keys(&self) -> HashSet<ContentHash> {
        self.entries.iter().map(|e| e.cache_key.clone()).collect()
    }

    /// The latest cache key per target name (default GC live set).
    #[must_use]
    pub fn latest_cache_keys(&self) -> HashSet<ContentHash> {
        self.latest_by_target
            .values()
            .filter_map(|&i| self.entries.get(i).map(|e| e.cache_key.clone()))
            .collect()
    }

    /// Total number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in append order.
    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::MemoryBackend;
    use chrono::TimeZone;

    fn entry(target: &str, fp_seed: &[u8], at_secs: i64) -> LedgerEntry {
        let value = Bytes::from(format!("value-of-{target}-{at_secs}"));
        LedgerEntry {
            entry_id: EntryId::generate(),
            run_id: RunId::generate(),
            target: target.to_string(),
            fingerprint: fingerprint_of(fp_seed),
            cache_key: ContentHash::of(&value),
            recorded_at: Utc.timestamp_opt(at_secs, 0).single().expect("timestamp"),
            duration_ms: 100,
            seed: None,
            recovered: false,
        }
    }

    fn fingerprint_of(bytes: &[u8]) -> Fingerprint {
        Fingerprint::from_hash(ContentHash::of(bytes))
    }

    #[tokio::test]
    async fn append_load_roundtrip() {
        let ledger = HistoryLedger::new(Arc::new(MemoryBackend::new()));
        let first = entry("a", b"fp-a", 100);
        let second = entry("b", b"fp-b", 200);

        ledger.append(&first).await.expect("append");
        ledger.append(&second).await.expect("append");
        // Duplicate delivery is a no-op.
        ledger.append(&first).await.expect("duplicate append");

        let loaded = ledger.load().await.expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].target, "a");
        assert_eq!(loaded[1].target, "b");
    }

    #[tokio::test]
    async fn purge_empties_the_ledger() {
        let ledger = HistoryLedger::new(Arc::new(MemoryBackend::new()));
        ledger.append(&entry("a", b"fp", 1)).await.expect("append");

        assert_eq!(ledger.purge().await.expect("purge"), 1);
        assert!(ledger.load().await.expect("load").is_empty());
    }

    #[test]
    fn latest_for_target_tracks_recency() {
        let old = entry("model", b"fp-1", 100);
        let new = entry("model", b"fp-2", 200);
        let new_key = new.cache_key.clone();

        let index = LedgerIndex::from_entries(vec![old, new]);
        let latest = index.latest_for_target("model").expect("present");
        assert_eq!(latest.cache_key, new_key);
        assert!(index.latest_for_target("other").is_none());
    }

    #[test]
    fn latest_by_fingerprint_ignores_name_and_prefers_recent() {
        let fp = fingerprint_of(b"shared");
        let mut older = entry("first_name", b"shared", 100);
        older.fingerprint = fp.clone();
        let mut newer = entry("second_name", b"shared", 300);
        newer.fingerprint = fp.clone();
        let newer_key = newer.cache_key.clone();

        // Insertion order deliberately newest-first.
        let index = LedgerIndex::from_entries(vec![newer, older]);
        let found = index.latest_by_fingerprint(&fp).expect("match");
        assert_eq!(found.target, "second_name");
        assert_eq!(found.cache_key, newer_key);
    }

    #[test]
    fn duration_table_uses_latest_entry() {
        let mut old = entry("t", b"fp-1", 100);
        old.duration_ms = 500;
        let mut new = entry("t", b"fp-2", 200);
        new.duration_ms = 900;

        let index = LedgerIndex::from_entries(vec![old, new]);
        assert_eq!(index.duration_table().get("t"), Some(&900));
    }

    #[test]
    fn gc_key_sets_differ_by_retention() {
        let old = entry("t", b"fp-1", 100);
        let new = entry("t", b"fp-2", 200);
        let old_key = old.cache_key.clone();
        let new_key = new.cache_key.clone();

        let index = LedgerIndex::from_entries(vec![old, new]);

        let all = index.all_cache_keys();
        assert!(all.contains(&old_key) && all.contains(&new_key));

        let latest = index.latest_cache_keys();
        assert!(latest.contains(&new_key));
        assert!(!latest.contains(&old_key));
    }
}
