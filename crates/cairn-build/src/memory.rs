//! Memory lifecycle management.
//!
//! Built values can be large, so which of them stay resident in the
//! process is a policy decision. Each target build runs three phases:
//!
//! 1. **Discard**: remove values from [`MemoryState`] per the strategy
//! 2. **Load**: fetch missing dependency values from the cache store
//! 3. **Keep**: after the build, retain or drop the fresh value
//!
//! | Strategy    | Discards               | Auto-loads deps | Keeps value |
//! |-------------|------------------------|-----------------|-------------|
//! | `speed`     | nothing                | yes             | yes         |
//! | `preclean`  | non-deps of current    | yes             | yes         |
//! | `autoclean` | non-deps of current    | yes             | no          |
//! | `lookahead` | non-deps of current or soon-to-run | yes  | yes         |
//! | `unload`    | everything             | no              | no          |
//! | `none`      | nothing                | no              | no          |
//!
//! Discard is bookkeeping only; values always remain recoverable from
//! the cache store. Under `unload` and `none` the manager does not
//! auto-load, so the command is responsible for pulling its own
//! dependency values through [`DepValues::value`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cairn_core::ContentHash;

use crate::cache::CacheStore;
use crate::error::{Error, Result};

/// Residency policy for built values around a build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    /// Keep everything resident; load missing deps.
    Speed,
    /// Discard non-dependencies before building; keep the result.
    Preclean,
    /// Discard non-dependencies before building; drop the result.
    Autoclean,
    /// Discard everything not needed by the current or soon-to-run
    /// targets; keep the result.
    Lookahead,
    /// Discard everything, load nothing, drop the result.
    Unload,
    /// Touch nothing: no discards, no loads, result not kept.
    None,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        Self::Speed
    }
}

impl std::fmt::Display for MemoryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Speed => write!(f, "speed"),
            Self::Preclean => write!(f, "preclean"),
            Self::Autoclean => write!(f, "autoclean"),
            Self::Lookahead => write!(f, "lookahead"),
            Self::Unload => write!(f, "unload"),
            Self::None => write!(f, "none"),
        }
    }
}

/// What the discard phase removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardScope {
    Nothing,
    NonDeps,
    NonDepsOrPending,
    Everything,
}

impl MemoryStrategy {
    const fn discard_scope(self) -> DiscardScope {
        match self {
            Self::Speed | Self::None => DiscardScope::Nothing,
            Self::Preclean | Self::Autoclean => DiscardScope::NonDeps,
            Self::Lookahead => DiscardScope::NonDepsOrPending,
            Self::Unload => DiscardScope::Everything,
        }
    }

    /// Returns true if the manager loads missing dependency values
    /// before the build.
    #[must_use]
    pub const fn autoloads_deps(self) -> bool {
        !matches!(self, Self::Unload | Self::None)
    }

    /// Returns true if the freshly built value stays resident.
    #[must_use]
    pub const fn keeps_value(self) -> bool {
        matches!(self, Self::Speed | Self::Preclean | Self::Lookahead)
    }
}

/// Process-wide map from target name to resident value.
///
/// Reset empty at run start; mutated only by the memory manager around
/// each build. Never persisted.
#[derive(Debug, Default)]
pub struct MemoryState {
    values: Mutex<HashMap<String, Bytes>>,
}

impl MemoryState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resident value for a target, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.lock().get(name).cloned()
    }

    /// Returns true if a value is resident.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Makes a value resident.
    pub fn insert(&self, name: impl Into<String>, value: Bytes) {
        self.lock().insert(name.into(), value);
    }

    /// Removes a value. Bookkeeping only: the cache still holds it.
    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Removes every value not in `keep`.
    pub fn retain_only(&self, keep: &HashSet<String>) {
        self.lock().retain(|name, _| keep.contains(name));
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of resident values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names of resident values, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // A poisoned lock means a panic mid-mutation; the map holds
        // only whole values, so continuing with it is sound.
        self.values.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Applies the three-phase residency policy around each build.
#[derive(Clone)]
pub struct MemoryManager {
    state: Arc<MemoryState>,
    cache: CacheStore,
    default_strategy: MemoryStrategy,
}

impl MemoryManager {
    /// Creates a manager over shared state and the cache store.
    #[must_use]
    pub fn new(state: Arc<MemoryState>, cache: CacheStore, default_strategy: MemoryStrategy) -> Self {
        Self {
            state,
            cache,
            default_strategy,
        }
    }

    /// Returns the shared memory state.
    #[must_use]
    pub fn state(&self) -> &Arc<MemoryState> {
        &self.state
    }

    /// Resolves a target's effective strategy.
    #[must_use]
    pub fn effective_strategy(&self, override_: Option<MemoryStrategy>) -> MemoryStrategy {
        override_.unwrap_or(self.default_strategy)
    }

    /// Discard and load phases, run before dispatching a target.
    ///
    /// `deps` are the target's direct dependencies, `dep_keys` their
    /// resolved cache keys, and `pending_needs` the names whose values
    /// the `lookahead` strategy must not discard (dependencies of
    /// targets that are ready or in flight).
    ///
    /// # Errors
    ///
    /// Returns a cache error if a missing dependency value cannot be
    /// loaded.
    pub async fn before_build(
        &self,
        strategy: MemoryStrategy,
        deps: &[String],
        dep_keys: &HashMap<String, ContentHash>,
        pending_needs: &HashSet<String>,
    ) -> Result<()> {
        match strategy.discard_scope() {
            DiscardScope::Nothing => {}
            DiscardScope::NonDeps => {
                let keep: HashSet<String> = deps.iter().cloned().collect();
                self.state.retain_only(&keep);
            }
            DiscardScope::NonDepsOrPending => {
                let mut keep: HashSet<String> = deps.iter().cloned().collect();
                keep.extend(pending_needs.iter().cloned());
                self.state.retain_only(&keep);
            }
            DiscardScope::Everything => self.state.clear(),
        }

        if strategy.autoloads_deps() {
            for dep in deps {
                if self.state.contains(dep) {
                    continue;
                }
                let key = dep_keys.get(dep).ok_or_else(|| Error::TargetNotFound {
                    name: dep.clone(),
                })?;
                let value = self.cache.get(key).await?;
                self.state.insert(dep.clone(), value);
            }
        }

        Ok(())
    }

    /// Keep phase, run after a successful build.
    pub fn after_build(&self, strategy: MemoryStrategy, target: &str, value: &Bytes) {
        if strategy.keeps_value() {
            self.state.insert(target.to_string(), value.clone());
        } else {
            self.state.remove(target);
        }
    }
}

/// Pull-based access to a target's dependency values, handed to the
/// running command.
///
/// Auto-loading strategies will have made values resident already;
/// under `unload`/`none` the command pulls each value straight from
/// the cache store, one at a time if it wants to bound memory.
#[derive(Clone)]
pub struct DepValues {
    names: Vec<String>,
    keys: HashMap<String, ContentHash>,
    state: Arc<MemoryState>,
    cache: CacheStore,
}

impl DepValues {
    pub(crate) fn new(
        names: Vec<String>,
        keys: HashMap<String, ContentHash>,
        state: Arc<MemoryState>,
        cache: CacheStore,
    ) -> Self {
        Self {
            names,
            keys,
            state,
            cache,
        }
    }

    /// Dependency names, in graph order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns a dependency's value if it is resident in memory.
    #[must_use]
    pub fn resident(&self, name: &str) -> Option<Bytes> {
        self.state.get(name)
    }

    /// Returns a dependency's value, from memory if resident,
    /// otherwise fetched from the cache store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotFound`] for a name that is not a
    /// dependency of the current target, or a cache error if the
    /// fetch fails.
    pub async fn value(&self, name: &str) -> Result<Bytes> {
        if let Some(value) = self.state.get(name) {
            return Ok(value);
        }
        let key = self.keys.get(name).ok_or_else(|| Error::TargetNotFound {
            name: name.to_string(),
        })?;
        self.cache.get(key).await
    }
}
