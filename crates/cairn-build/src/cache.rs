//! Content-addressable cache store.
//!
//! Artifacts are stored under their own content hash, with a metadata
//! document beside each blob. Entries are append-only: a key's payload
//! is never overwritten. Re-putting identical bytes is a no-op (another
//! worker got there first); re-putting *different* bytes under the same
//! key means the hash engine is broken or the store was tampered with,
//! and aborts the run via [`Error::CacheConsistency`].
//!
//! Transient storage failures are retried a bounded number of times
//! before escalating to [`Error::CacheIo`]; the scheduler then scopes
//! that failure to the single target touching the cache.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Error, Result};

/// Attempts per storage operation before escalating to `CacheIo`.
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Metadata stored beside each cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// When the artifact was built.
    pub built_at: DateTime<Utc>,
    /// How long the build took.
    pub duration_ms: u64,
    /// Seed used, if the target was seeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Name of the target that produced this artifact. Informational:
    /// lookups are always by hash, never by this name.
    pub origin_target: String,
    /// True if the artifact was adopted from history rather than built.
    #[serde(default)]
    pub recovered: bool,
}

/// Content-addressable store over a [`StorageBackend`].
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
}

impl CacheStore {
    /// Creates a cache store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn blob_path(key: &ContentHash) -> String {
        let hex = key.hex();
        // Two-level fanout keeps directory listings manageable.
        format!("cache/objects/{}/{hex}", &hex[..2.min(hex.len())])
    }

    fn meta_path(key: &ContentHash) -> String {
        format!("cache/meta/{}.json", key.hex())
    }

    /// Stores an artifact under its content hash.
    ///
    /// Idempotent for identical bytes. The metadata document is only
    /// written by the first successful put for a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheConsistency`] if the key already holds
    /// different bytes, or [`Error::CacheIo`] if storage fails after
    /// retries.
    #[tracing::instrument(skip(self, value, meta), fields(key = %key, bytes = value.len()))]
    pub async fn put(&self, key: &ContentHash, value: Bytes, meta: &CacheMetadata) -> Result<()> {
        let path = Self::blob_path(key);

        let result = with_retry(key, || {
            self.backend
                .put(&path, value.clone(), WritePrecondition::DoesNotExist)
        })
        .await?;

        if matches!(result, WriteResult::PreconditionFailed) {
            let existing = with_retry(key, || self.backend.get(&path)).await?;
            if existing != value {
                tracing::error!(key = %key, "cache key collision with differing payload");
                return Err(Error::CacheConsistency {
                    key: key.as_str().to_string(),
                });
            }
            tracing::debug!(key = %key, "cache entry already present");
            return Ok(());
        }

        let meta_bytes = serde_json::to_vec(meta).map_err(|e| Error::Serialization {
            message: format!("failed to serialize cache metadata: {e}"),
        })?;
        let meta_path = Self::meta_path(key);
        with_retry(key, || {
            self.backend.put(
                &meta_path,
                Bytes::from(meta_bytes.clone()),
                WritePrecondition::DoesNotExist,
            )
        })
        .await?;

        tracing::debug!(key = %key, "cache entry written");
        Ok(())
    }

    /// Fetches an artifact by key.
    ///
    /// # Errors
    ///
    /// Returns `cairn_core::Error::NotFound` (wrapped in
    /// [`Error::Core`]) if the key is absent, or [`Error::CacheIo`] on
    /// storage failure.
    pub async fn get(&self, key: &ContentHash) -> Result<Bytes> {
        let path = Self::blob_path(key);
        with_retry(key, || self.backend.get(&path)).await
    }

    /// Fetches an artifact, mapping absence to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure.
    pub async fn try_get(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        match self.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::Core(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns true if the key is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure.
    pub async fn exists(&self, key: &ContentHash) -> Result<bool> {
        let path = Self::blob_path(key);
        with_retry(key, || self.backend.exists(&path)).await
    }

    /// Reads the metadata document for a key, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure or
    /// [`Error::Serialization`] on a corrupt document.
    pub async fn metadata(&self, key: &ContentHash) -> Result<Option<CacheMetadata>> {
        let meta_path = Self::meta_path(key);
        let bytes = match with_retry(key, || self.backend.get(&meta_path)).await {
            Ok(bytes) => bytes,
            Err(Error::Core(e)) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
            message: format!("corrupt cache metadata for {key}: {e}"),
        })?;
        Ok(Some(meta))
    }

    /// Lists every key currently in the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure.
    pub async fn keys(&self) -> Result<Vec<ContentHash>> {
        let metas = self
            .backend
            .list("cache/objects/")
            .await
            .map_err(Error::Core)?;
        Ok(metas
            .into_iter()
            .filter_map(|m| {
                m.path
                    .rsplit('/')
                    .next()
                    .and_then(|hex| format!("sha256:{hex}").parse().ok())
            })
            .collect())
    }

    /// Lists the keys that [`garbage_collect`](Self::garbage_collect)
    /// would remove, without removing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure.
    pub async fn garbage_collect_dry_run(
        &self,
        live: &HashSet<ContentHash>,
    ) -> Result<Vec<ContentHash>> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|key| !live.contains(key))
            .collect())
    }

    /// Removes entries whose keys are not in `live`. Returns the
    /// removed keys.
    ///
    /// Callers derive `live` from the history ledger: with history
    /// retention, every key the ledger references; without, only the
    /// latest key per target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheIo`] on storage failure.
    #[tracing::instrument(skip(self, live))]
    pub async fn garbage_collect(&self, live: &HashSet<ContentHash>) -> Result<Vec<ContentHash>> {
        let mut removed = Vec::new();
        for key in self.keys().await? {
            if live.contains(&key) {
                continue;
            }
            let blob_path = Self::blob_path(&key);
            let meta_path = Self::meta_path(&key);
            with_retry(&key, || self.backend.delete(&blob_path)).await?;
            with_retry(&key, || self.backend.delete(&meta_path)).await?;
            removed.push(key);
        }
        tracing::info!(removed = removed.len(), "cache garbage collection finished");
        Ok(removed)
    }
}

/// Retries a storage operation on transient failures, then escalates
/// to [`Error::CacheIo`]. Not-found and precondition outcomes pass
/// through untouched.
async fn with_retry<T, F, Fut>(key: &ContentHash, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = cairn_core::Result<T>>,
{
    let mut last_message = String::new();
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ cairn_core::Error::Storage { .. }) => {
                last_message = e.to_string();
                tracing::warn!(key = %key, attempt, error = %e, "cache storage operation failed");
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
            }
            Err(e) => return Err(Error::Core(e)),
        }
    }
    Err(Error::CacheIo {
        key: key.as_str().to_string(),
        message: format!("{last_message} (after {MAX_ATTEMPTS} attempts)"),
        source: None,
    })
}
