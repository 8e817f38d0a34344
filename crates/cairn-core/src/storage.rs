//! Storage backend abstraction for durable artifact and ledger data.
//!
//! The cache store and history ledger both persist through this trait,
//! so a single backend choice governs where build state lives. Two
//! implementations are provided:
//!
//! - [`MemoryBackend`]: thread-safe in-memory map, for tests
//! - [`LocalFsBackend`]: a directory tree on local disk, with atomic
//!   temp-file-then-rename writes so readers never observe a partial
//!   object
//!
//! Keys are forward-slash-separated relative paths (`cache/ab12...`,
//! `ledger/01ARZ....json`). The conditional-write precondition gives
//! callers idempotent append semantics without a separate lock.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, Copy)]
pub enum WritePrecondition {
    /// Write only if the object does not already exist.
    DoesNotExist,
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
///
/// A failed precondition is a normal outcome, not an error: append-only
/// writers treat it as "someone already wrote this" and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The write succeeded.
    Success,
    /// The precondition was not met; the object was left untouched.
    PreconditionFailed,
}

impl WriteResult {
    /// Returns true if the write succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key (relative path).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Storage backend trait for durable build state.
///
/// Implementations must be safe for concurrent use from multiple
/// workers; per-key write serialization is the backend's job.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object, honoring the precondition.
    ///
    /// A failed precondition is reported via [`WriteResult`], never as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the underlying medium fails.
    async fn put(&self, path: &str, data: Bytes, precondition: WritePrecondition)
        -> Result<WriteResult>;

    /// Deletes an object. Idempotent: succeeds if the object is absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the underlying medium fails.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects under the given prefix.
    ///
    /// Results are sorted by path for deterministic iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the underlying medium fails.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Returns true if the object exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the underlying medium fails.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not durable.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| lock_poisoned())?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| lock_poisoned())?;

        if matches!(precondition, WritePrecondition::DoesNotExist) && objects.contains_key(path) {
            return Ok(WriteResult::PreconditionFailed);
        }

        objects.insert(path.to_string(), data);
        Ok(WriteResult::Success)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| lock_poisoned())?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| lock_poisoned())?;
        let mut metas: Vec<ObjectMeta> = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, data)| ObjectMeta {
                path: path.clone(),
                size: data.len() as u64,
            })
            .collect();
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(metas)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let objects = self.objects.read().map_err(|_| lock_poisoned())?;
        Ok(objects.contains_key(path))
    }
}

/// Local-filesystem storage backend.
///
/// Objects are stored under a root directory with keys mapped directly
/// to relative paths. Writes go to a temporary sibling file first and
/// are renamed into place, so concurrent readers see either the old
/// object or the complete new one, never a partial write.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Creates a backend rooted at the given directory.
    ///
    /// The directory is created lazily on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::InvalidInput(format!("invalid storage key: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {path}"),
                e,
            )),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let full = self.resolve(path)?;

        if matches!(precondition, WritePrecondition::DoesNotExist)
            && tokio::fs::try_exists(&full).await.unwrap_or(false)
        {
            return Ok(WriteResult::PreconditionFailed);
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("failed to create directory for {path}"), e)
            })?;
        }

        // Atomic publish: write to a temp sibling, then rename.
        let tmp = full.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to write {path}"), e))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to publish {path}"), e))?;

        Ok(WriteResult::Success)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to delete {path}"),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut metas = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("failed to list {}", dir.display()),
                        e,
                    ));
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                Error::storage_with_source(format!("failed to list {}", dir.display()), e)
            })? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    Error::storage_with_source(
                        format!("failed to stat {}", entry_path.display()),
                        e,
                    )
                })?;

                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }

                let Ok(rel) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");

                // In-progress temp files are not objects.
                if key.contains(".tmp.") {
                    continue;
                }

                if key.starts_with(prefix) {
                    let size = entry
                        .metadata()
                        .await
                        .map(|m| m.len())
                        .unwrap_or_default();
                    metas.push(ObjectMeta { path: key, size });
                }
            }
        }

        metas.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(metas)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to stat {path}"), e))
    }
}
