//! Parallel build scheduler.
//!
//! The [`Executor`] drives one run: it validates the plan into a
//! dependency graph, fingerprints every target, then dispatches
//! targets whose dependencies are complete onto worker slots. Before
//! dispatching it consults the history ledger, so unchanged targets
//! are skipped and renamed-but-identical targets are recovered without
//! running their commands.
//!
//! Per-target failures stay scoped: the failed target's transitive
//! dependents are skipped and everything else continues. A cache
//! consistency violation aborts the whole run.
//!
//! The ready queue is kept in topological order with plan-order
//! tie-breaking, so two runs of the same plan dispatch in the same
//! order regardless of worker count.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use cairn_core::observability;
use cairn_core::{ContentHash, EntryId, RunId, StorageBackend};

use crate::cache::{CacheMetadata, CacheStore};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintEngine};
use crate::graph::DependencyGraph;
use crate::history::{HistoryLedger, LedgerEntry, LedgerIndex};
use crate::memory::{DepValues, MemoryManager, MemoryState, MemoryStrategy};
use crate::metrics;
use crate::plan::Plan;
use crate::report::{RunReport, TargetOutcome, TargetStatus};
use crate::runner::{BuildContext, Runner};
use crate::target::Target;

/// One worker slot: a unit of build parallelism with capability tags.
///
/// A target with a non-empty affinity set may only run on a slot
/// sharing at least one tag. Untagged targets run anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSlotSpec {
    /// Slot name, for logs.
    pub name: String,
    /// Capability tags.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl WorkerSlotSpec {
    /// Creates an untagged slot.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
        }
    }

    /// Adds a capability tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Creates `count` untagged slots named `w0..wN`.
    #[must_use]
    pub fn untagged(count: usize) -> Vec<Self> {
        (0..count).map(|i| Self::new(format!("w{i}"))).collect()
    }

    pub(crate) fn can_run(&self, target: &Target) -> bool {
        target.affinity.is_empty() || !self.tags.is_disjoint(&target.affinity)
    }
}

/// Run-wide execution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    /// Worker slots. Empty means one untagged slot.
    pub workers: Vec<WorkerSlotSpec>,
    /// Default memory strategy; targets may override.
    pub memory_strategy: MemoryStrategy,
    /// Whether to adopt matching artifacts recorded under other names.
    pub recover: bool,
    /// Whether to garbage-collect the cache after the run.
    pub garbage_collect: bool,
    /// With history retention, garbage collection keeps every cache key
    /// the ledger references; without, only the latest key per target.
    pub keep_history: bool,
    /// Environment descriptors mixed into every fingerprint.
    pub env: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            memory_strategy: MemoryStrategy::Speed,
            recover: true,
            garbage_collect: false,
            keep_history: true,
            env: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// Sets the worker slots.
    #[must_use]
    pub fn workers(mut self, workers: Vec<WorkerSlotSpec>) -> Self {
        self.workers = workers;
        self
    }

    /// Sets `count` untagged worker slots.
    #[must_use]
    pub fn jobs(mut self, count: usize) -> Self {
        self.workers = WorkerSlotSpec::untagged(count.max(1));
        self
    }

    /// Sets the default memory strategy.
    #[must_use]
    pub const fn memory_strategy(mut self, strategy: MemoryStrategy) -> Self {
        self.memory_strategy = strategy;
        self
    }

    /// Enables or disables rename recovery.
    #[must_use]
    pub const fn recover(mut self, enabled: bool) -> Self {
        self.recover = enabled;
        self
    }

    /// Enables post-run garbage collection.
    #[must_use]
    pub const fn garbage_collect(mut self, enabled: bool) -> Self {
        self.garbage_collect = enabled;
        self
    }

    /// Sets history retention for garbage collection.
    #[must_use]
    pub const fn keep_history(mut self, enabled: bool) -> Self {
        self.keep_history = enabled;
        self
    }

    /// Adds an environment descriptor to every fingerprint.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Handle for cancelling a run in progress.
///
/// Cancellation stops new dispatches; in-flight builds finish and are
/// recorded normally. Undispatched targets end as
/// [`TargetStatus::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What one worker sends back on completion.
struct WorkerDone {
    target: String,
    slot: usize,
    result: Result<BuiltArtifact>,
}

struct BuiltArtifact {
    value: Bytes,
    key: ContentHash,
    duration_ms: u64,
}

/// Executes plans against a cache store and history ledger.
pub struct Executor {
    cache: CacheStore,
    ledger: HistoryLedger,
    options: BuildOptions,
    cancel: CancelHandle,
}

impl Executor {
    /// Creates an executor over a storage backend shared by the cache
    /// store and the history ledger.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, options: BuildOptions) -> Self {
        Self {
            cache: CacheStore::new(Arc::clone(&backend)),
            ledger: HistoryLedger::new(backend),
            options,
            cancel: CancelHandle::default(),
        }
    }

    /// Returns the cache store this executor writes to.
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Returns the history ledger this executor appends to.
    #[must_use]
    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    /// Returns a handle that can cancel runs started by this executor.
    ///
    /// Cancellation is sticky: once requested, every later run on this
    /// executor also ends cancelled. Build a new executor over the
    /// same backend to resume.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Executes a plan to completion and returns the run report.
    ///
    /// # Errors
    ///
    /// Returns a fatal error for invalid plans (cycles, dangling
    /// dependencies, duplicate outputs), unsatisfiable worker affinity,
    /// fingerprinting failures, ledger IO failures, or cache
    /// consistency violations. Per-target command failures do not error
    /// here; they appear in the report.
    #[tracing::instrument(skip_all, fields(targets = plan.len()))]
    pub async fn execute(&self, plan: &Plan, runner: Arc<dyn Runner>) -> Result<RunReport> {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = RunId::generate();
        tracing::info!(run_id = %run_id, plan_digest = %plan.digest, "run started");

        let graph = DependencyGraph::build(plan)?;
        let slots = self.validated_slots(plan)?;

        let engine = FingerprintEngine::new(self.options.env.clone());
        let fingerprints = engine.compute_all(plan, &graph).await?;

        let mut index = LedgerIndex::from_entries(self.ledger.load().await?);

        let memory = Arc::new(MemoryState::new());
        let manager = MemoryManager::new(
            Arc::clone(&memory),
            self.cache.clone(),
            self.options.memory_strategy,
        );

        let mut state = RunState::new(plan, &graph, &fingerprints);
        let mut slot_busy = vec![false; slots.len()];
        let mut running: HashSet<String> = HashSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerDone>();
        let mut in_flight = 0usize;

        loop {
            if state.finished_count() == plan.len() {
                break;
            }

            if self.cancel.is_cancelled() && in_flight == 0 {
                state.cancel_remaining();
                break;
            }

            let mut progress = false;
            if !self.cancel.is_cancelled() {
                progress = self
                    .dispatch_pass(
                        plan, &graph, &mut state, &mut index, &manager, &slots, &mut slot_busy,
                        &mut running, &mut in_flight, run_id, &runner, &tx,
                    )
                    .await?;
            }

            if state.finished_count() == plan.len() {
                break;
            }

            if in_flight == 0 {
                if self.cancel.is_cancelled() {
                    continue;
                }
                if progress {
                    continue;
                }
                // Static validation should make this unreachable, but a
                // silent hang would be worse than an error.
                return Err(Error::scheduling(format!(
                    "no runnable target and no build in flight ({} of {} finished)",
                    state.finished_count(),
                    plan.len()
                )));
            }

            let done = rx
                .recv()
                .await
                .ok_or_else(|| Error::scheduling("worker channel closed unexpectedly"))?;
            in_flight -= 1;
            slot_busy[done.slot] = false;
            running.remove(&done.target);

            self.handle_completion(plan, &mut state, &mut index, &manager, run_id, done)
                .await?;
            metrics::record_resident(memory.len());
        }

        let gc_removed = if self.options.garbage_collect {
            let live = if self.options.keep_history {
                index.all_cache_keys()
            } else {
                index.latest_cache_keys()
            };
            let removed = self.cache.garbage_collect(&live).await?;
            metrics::record_gc(removed.len());
            removed
        } else {
            Vec::new()
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        metrics::record_run(elapsed_ms);

        let report = RunReport {
            run_id,
            plan_digest: plan.digest.clone(),
            started_at,
            elapsed_ms,
            outcomes: state.outcomes,
            gc_removed,
        };
        tracing::info!(
            run_id = %run_id,
            elapsed_ms,
            built = report.count(TargetStatus::Built),
            skipped = report.count(TargetStatus::SkippedUpToDate),
            recovered = report.count(TargetStatus::Recovered),
            failed = report.count(TargetStatus::Failed),
            "run finished"
        );
        Ok(report)
    }

    /// Normalizes the slot list and checks that every target has at
    /// least one compatible slot.
    fn validated_slots(&self, plan: &Plan) -> Result<Vec<WorkerSlotSpec>> {
        let slots = if self.options.workers.is_empty() {
            WorkerSlotSpec::untagged(1)
        } else {
            self.options.workers.clone()
        };

        for target in plan.iter() {
            if !slots.iter().any(|s| s.can_run(target)) {
                let tags = target.affinity.iter().cloned().collect::<Vec<_>>().join(", ");
                return Err(Error::scheduling(format!(
                    "target '{}' requires affinity [{tags}] but no worker slot carries any of those tags",
                    target.name
                )));
            }
        }
        Ok(slots)
    }

    /// Resolves skips and recoveries, then dispatches as many ready
    /// targets as free compatible slots allow. Returns true if any
    /// target finished or was dispatched.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_pass(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        state: &mut RunState<'_>,
        index: &mut LedgerIndex,
        manager: &MemoryManager,
        slots: &[WorkerSlotSpec],
        slot_busy: &mut [bool],
        running: &mut HashSet<String>,
        in_flight: &mut usize,
        run_id: RunId,
        runner: &Arc<dyn Runner>,
        tx: &mpsc::UnboundedSender<WorkerDone>,
    ) -> Result<bool> {
        let mut progress = false;

        // Skips and recoveries complete without a worker and may ready
        // further targets, so loop to a fixpoint before dispatching.
        // Cache IO raised while checking a single target stays scoped
        // to that target; only fatal errors abort the run.
        loop {
            let mut resolved_any = false;
            for name in state.ready_in_order() {
                if state.is_finished(&name) {
                    continue;
                }
                match self
                    .resolve_without_build(plan, &name, state, index, run_id)
                    .await
                {
                    Ok(Some(outcome)) => {
                        let key = outcome.cache_key.clone();
                        state.complete(&name, outcome, key);
                        resolved_any = true;
                        progress = true;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(target = %name, error = %e, "cache check failed");
                        state.fail(&name, &e.to_string());
                        resolved_any = true;
                        progress = true;
                    }
                }
            }
            if !resolved_any {
                break;
            }
        }

        for name in state.ready_in_order() {
            if state.is_finished(&name) {
                continue;
            }
            let target = plan.get(&name).ok_or_else(|| Error::TargetNotFound {
                name: name.clone(),
            })?;
            let Some(slot) = free_slot(slots, slot_busy, target) else {
                continue;
            };

            let strategy = target.effective_strategy(self.options.memory_strategy);
            let deps: Vec<String> = graph.deps(&name).to_vec();
            let dep_keys = state.dep_keys(&deps);
            let pending_needs = state.pending_needs(graph, running);
            if let Err(e) = manager
                .before_build(strategy, &deps, &dep_keys, &pending_needs)
                .await
            {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(target = %name, error = %e, "dependency load failed");
                state.fail(&name, &e.to_string());
                progress = true;
                continue;
            }

            let ctx = BuildContext {
                target: name.clone(),
                command: target.command.clone(),
                seed: target.seed,
                run_id,
                deps: DepValues::new(
                    deps,
                    dep_keys,
                    Arc::clone(manager.state()),
                    self.cache.clone(),
                ),
            };

            slot_busy[slot] = true;
            *in_flight += 1;
            running.insert(name.clone());
            state.mark_dispatched(&name);
            progress = true;
            tracing::debug!(target = %name, slot = %slots[slot].name, "target dispatched");

            let cache = self.cache.clone();
            let runner = Arc::clone(runner);
            let tx = tx.clone();
            let span = observability::build_span(&name, &run_id.to_string());
            tokio::spawn(
                async move {
                    let build_started = Instant::now();
                    let result = run_one(&runner, &ctx, &cache, build_started).await;
                    // A closed channel means the run already aborted.
                    let _ = tx.send(WorkerDone {
                        target: ctx.target,
                        slot,
                        result,
                    });
                }
                .instrument(span),
            );
        }

        Ok(progress)
    }

    /// Checks whether a ready target can finish without running:
    /// up-to-date under its own name, or recoverable from an entry
    /// under another name.
    async fn resolve_without_build(
        &self,
        plan: &Plan,
        name: &str,
        state: &RunState<'_>,
        index: &mut LedgerIndex,
        run_id: RunId,
    ) -> Result<Option<TargetOutcome>> {
        let fingerprint = state.fingerprint(name)?;

        if let Some(latest) = index.latest_for_target(name) {
            if latest.fingerprint == *fingerprint && self.cache.exists(&latest.cache_key).await? {
                tracing::debug!(target = %name, "up to date");
                return Ok(Some(TargetOutcome {
                    status: TargetStatus::SkippedUpToDate,
                    error: None,
                    duration_ms: 0,
                    cache_key: Some(latest.cache_key.clone()),
                    fingerprint: Some(fingerprint.clone()),
                }));
            }
        }

        if self.options.recover {
            if let Some(donor) = index.latest_by_fingerprint(fingerprint) {
                if self.cache.exists(&donor.cache_key).await? {
                    let entry = LedgerEntry {
                        entry_id: EntryId::generate(),
                        run_id,
                        target: name.to_string(),
                        fingerprint: fingerprint.clone(),
                        cache_key: donor.cache_key.clone(),
                        recorded_at: Utc::now(),
                        duration_ms: donor.duration_ms,
                        seed: plan.get(name).and_then(|t| t.seed),
                        recovered: true,
                    };
                    tracing::info!(
                        target = %name,
                        donor = %donor.target,
                        "recovered artifact from history"
                    );
                    self.ledger.append(&entry).await?;
                    let outcome = TargetOutcome {
                        status: TargetStatus::Recovered,
                        error: None,
                        duration_ms: entry.duration_ms,
                        cache_key: Some(entry.cache_key.clone()),
                        fingerprint: Some(fingerprint.clone()),
                    };
                    index.insert(entry);
                    return Ok(Some(outcome));
                }
            }
        }

        Ok(None)
    }

    /// Records a worker's result: ledger and memory bookkeeping on
    /// success, scoped failure and dependent skipping otherwise.
    async fn handle_completion(
        &self,
        plan: &Plan,
        state: &mut RunState<'_>,
        index: &mut LedgerIndex,
        manager: &MemoryManager,
        run_id: RunId,
        done: WorkerDone,
    ) -> Result<()> {
        let name = done.target;
        match done.result {
            Ok(artifact) => {
                let fingerprint = state.fingerprint(&name)?.clone();
                let target = plan.get(&name).ok_or_else(|| Error::TargetNotFound {
                    name: name.clone(),
                })?;
                let entry = LedgerEntry {
                    entry_id: EntryId::generate(),
                    run_id,
                    target: name.clone(),
                    fingerprint: fingerprint.clone(),
                    cache_key: artifact.key.clone(),
                    recorded_at: Utc::now(),
                    duration_ms: artifact.duration_ms,
                    seed: target.seed,
                    recovered: false,
                };
                self.ledger.append(&entry).await?;
                index.insert(entry);

                let strategy = target.effective_strategy(self.options.memory_strategy);
                manager.after_build(strategy, &name, &artifact.value);

                tracing::info!(
                    target = %name,
                    duration_ms = artifact.duration_ms,
                    key = %artifact.key,
                    "target built"
                );
                let outcome = TargetOutcome {
                    status: TargetStatus::Built,
                    error: None,
                    duration_ms: artifact.duration_ms,
                    cache_key: Some(artifact.key.clone()),
                    fingerprint: Some(fingerprint),
                };
                state.complete(&name, outcome, Some(artifact.key));
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(target = %name, error = %e, "target failed");
                state.fail(&name, &e.to_string());
                Ok(())
            }
        }
    }
}

fn free_slot(slots: &[WorkerSlotSpec], busy: &[bool], target: &Target) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .find(|(i, slot)| !busy[*i] && slot.can_run(target))
        .map(|(i, _)| i)
}

/// Executes one target on a worker: run the command, hash the value,
/// store it.
async fn run_one(
    runner: &Arc<dyn Runner>,
    ctx: &BuildContext,
    cache: &CacheStore,
    started: Instant,
) -> Result<BuiltArtifact> {
    let value = runner.run(ctx).await?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let key = ContentHash::of(&value);
    let meta = CacheMetadata {
        built_at: Utc::now(),
        duration_ms,
        seed: ctx.seed,
        origin_target: ctx.target.clone(),
        recovered: false,
    };
    cache.put(&key, value.clone(), &meta).await?;
    Ok(BuiltArtifact {
        value,
        key,
        duration_ms,
    })
}

/// Mutable per-run bookkeeping: which targets are ready, dispatched,
/// or finished, and with what outcome.
struct RunState<'a> {
    graph: &'a DependencyGraph,
    fingerprints: &'a HashMap<String, Fingerprint>,
    topo_position: HashMap<&'a str, usize>,
    remaining_deps: HashMap<String, usize>,
    ready: Vec<String>,
    outcomes: BTreeMap<String, TargetOutcome>,
    cache_keys: HashMap<String, ContentHash>,
    finished: HashSet<String>,
}

impl<'a> RunState<'a> {
    fn new(
        plan: &'a Plan,
        graph: &'a DependencyGraph,
        fingerprints: &'a HashMap<String, Fingerprint>,
    ) -> Self {
        let topo_position: HashMap<&str, usize> = graph
            .topo_order()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut remaining_deps = HashMap::with_capacity(plan.len());
        let mut ready = Vec::new();
        for target in plan.iter() {
            let count = graph.deps(&target.name).len();
            remaining_deps.insert(target.name.clone(), count);
            if count == 0 {
                ready.push(target.name.clone());
            }
        }

        let mut state = Self {
            graph,
            fingerprints,
            topo_position,
            remaining_deps,
            ready,
            outcomes: BTreeMap::new(),
            cache_keys: HashMap::new(),
            finished: HashSet::new(),
        };
        state.sort_ready();
        state
    }

    fn sort_ready(&mut self) {
        let positions = &self.topo_position;
        self.ready
            .sort_by_key(|name| positions.get(name.as_str()).copied().unwrap_or(usize::MAX));
    }

    fn ready_in_order(&self) -> Vec<String> {
        self.ready.clone()
    }

    fn fingerprint(&self, name: &str) -> Result<&Fingerprint> {
        self.fingerprints
            .get(name)
            .ok_or_else(|| Error::TargetNotFound {
                name: name.to_string(),
            })
    }

    fn dep_keys(&self, deps: &[String]) -> HashMap<String, ContentHash> {
        deps.iter()
            .filter_map(|d| self.cache_keys.get(d).map(|k| (d.clone(), k.clone())))
            .collect()
    }

    /// Names whose values upcoming builds still need: dependencies of
    /// every ready or running target.
    fn pending_needs(&self, graph: &DependencyGraph, running: &HashSet<String>) -> HashSet<String> {
        let mut needs = HashSet::new();
        for name in self.ready.iter().chain(running.iter()) {
            needs.extend(graph.deps(name).iter().cloned());
        }
        needs
    }

    fn mark_dispatched(&mut self, name: &str) {
        self.ready.retain(|n| n != name);
    }

    /// Records a successful terminal outcome and readies dependents
    /// whose last dependency this was.
    fn complete(&mut self, name: &str, outcome: TargetOutcome, key: Option<ContentHash>) {
        metrics::record_target(outcome.status, outcome.duration_ms);
        self.outcomes.insert(name.to_string(), outcome);
        self.finished.insert(name.to_string());
        self.ready.retain(|n| n != name);
        if let Some(key) = key {
            self.cache_keys.insert(name.to_string(), key);
        }

        for dependent in self.graph.direct_dependents(name) {
            if self.finished.contains(&dependent) {
                continue;
            }
            if let Some(count) = self.remaining_deps.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push(dependent);
                }
            }
        }
        self.sort_ready();
    }

    /// Records a failure and skips every unfinished transitive
    /// dependent.
    fn fail(&mut self, name: &str, message: &str) {
        metrics::record_target(TargetStatus::Failed, 0);
        self.outcomes.insert(
            name.to_string(),
            TargetOutcome::skipped(TargetStatus::Failed, Some(message.to_string())),
        );
        self.finished.insert(name.to_string());
        self.ready.retain(|n| n != name);

        for dependent in self.graph.transitive_dependents(name) {
            if self.finished.insert(dependent.clone()) {
                metrics::record_target(TargetStatus::SkippedUpstreamFailure, 0);
                self.outcomes.insert(
                    dependent.clone(),
                    TargetOutcome::skipped(
                        TargetStatus::SkippedUpstreamFailure,
                        Some(format!("upstream target '{name}' failed")),
                    ),
                );
                self.ready.retain(|n| n != &dependent);
            }
        }
    }

    /// Marks everything not yet finished as cancelled.
    fn cancel_remaining(&mut self) {
        let unfinished: Vec<String> = self
            .remaining_deps
            .keys()
            .filter(|name| !self.finished.contains(*name))
            .cloned()
            .collect();
        for name in unfinished {
            metrics::record_target(TargetStatus::Cancelled, 0);
            self.outcomes.insert(
                name.clone(),
                TargetOutcome::skipped(TargetStatus::Cancelled, None),
            );
            self.finished.insert(name);
        }
        self.ready.clear();
    }

    fn is_finished(&self, name: &str) -> bool {
        self.finished.contains(name)
    }

    fn finished_count(&self) -> usize {
        self.finished.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{FailingRunner, NoOpRunner};
    use crate::target::Target;
    use async_trait::async_trait;
    use cairn_core::{MemoryBackend, ObjectMeta, WritePrecondition, WriteResult};

    fn executor(options: BuildOptions) -> Executor {
        Executor::new(Arc::new(MemoryBackend::new()), options)
    }

    /// Delegates to a memory backend but refuses reads or existence
    /// checks on cache objects once the matching flag is set. Writes
    /// and the ledger keep working.
    struct BrokenObjectStore {
        inner: MemoryBackend,
        fail_get: AtomicBool,
        fail_exists: AtomicBool,
    }

    impl BrokenObjectStore {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_get: AtomicBool::new(false),
                fail_exists: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for BrokenObjectStore {
        async fn get(&self, path: &str) -> cairn_core::Result<Bytes> {
            if self.fail_get.load(Ordering::SeqCst) && path.starts_with("cache/objects/") {
                return Err(cairn_core::Error::storage(format!("read refused: {path}")));
            }
            self.inner.get(path).await
        }

        async fn put(
            &self,
            path: &str,
            data: Bytes,
            precondition: WritePrecondition,
        ) -> cairn_core::Result<WriteResult> {
            self.inner.put(path, data, precondition).await
        }

        async fn delete(&self, path: &str) -> cairn_core::Result<()> {
            self.inner.delete(path).await
        }

        async fn list(&self, prefix: &str) -> cairn_core::Result<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }

        async fn exists(&self, path: &str) -> cairn_core::Result<bool> {
            if self.fail_exists.load(Ordering::SeqCst) && path.starts_with("cache/objects/") {
                return Err(cairn_core::Error::storage(format!("stat refused: {path}")));
            }
            self.inner.exists(path).await
        }
    }

    fn chain_with_island() -> Plan {
        Plan::builder()
            .target(Target::new("up", "u()"))
            .target(Target::new("down", "d(up)").dep("up"))
            .target(Target::new("island", "i()"))
            .build()
            .expect("plan")
    }

    #[tokio::test]
    async fn dependency_load_failure_scopes_to_the_dependent() {
        let backend = Arc::new(BrokenObjectStore::new());
        backend.fail_get.store(true, Ordering::SeqCst);

        // Autoclean drops built values from memory, so building "down"
        // has to read "up" back from the cache, which fails here.
        let exec = Executor::new(
            backend,
            BuildOptions::default().memory_strategy(MemoryStrategy::Autoclean),
        );
        let report = exec
            .execute(&chain_with_island(), Arc::new(NoOpRunner))
            .await
            .expect("run completes despite cache IO failure");

        assert_eq!(report.outcomes["up"].status, TargetStatus::Built);
        assert_eq!(report.outcomes["down"].status, TargetStatus::Failed);
        assert!(report.outcomes["down"]
            .error
            .as_deref()
            .unwrap_or("")
            .contains("read refused"));
        assert_eq!(report.outcomes["island"].status, TargetStatus::Built);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn up_to_date_check_io_failure_scopes_to_the_target() {
        let backend = Arc::new(BrokenObjectStore::new());
        let plan = chain_with_island();

        let exec = Executor::new(backend.clone(), BuildOptions::default());
        exec.execute(&plan, Arc::new(NoOpRunner)).await.expect("first run");

        // The second run's up-to-date checks stat cache keys; those
        // failures mark the target failed instead of aborting the run.
        backend.fail_exists.store(true, Ordering::SeqCst);
        let exec = Executor::new(backend, BuildOptions::default());
        let report = exec
            .execute(&plan, Arc::new(NoOpRunner))
            .await
            .expect("second run completes despite cache IO failure");

        assert_eq!(report.outcomes["up"].status, TargetStatus::Failed);
        assert_eq!(
            report.outcomes["down"].status,
            TargetStatus::SkippedUpstreamFailure
        );
        assert_eq!(report.outcomes["island"].status, TargetStatus::Failed);
    }

    fn diamond_plan() -> Plan {
        Plan::builder()
            .target(Target::new("data", "load()"))
            .target(Target::new("left", "l(data)").dep("data"))
            .target(Target::new("right", "r(data)").dep("data"))
            .target(Target::new("out", "merge(l, r)").dep("left").dep("right"))
            .build()
            .expect("plan")
    }

    #[tokio::test]
    async fn first_run_builds_everything() {
        let exec = executor(BuildOptions::default());
        let report = exec
            .execute(&diamond_plan(), Arc::new(NoOpRunner))
            .await
            .expect("run");

        assert!(report.succeeded());
        assert_eq!(report.count(TargetStatus::Built), 4);
        for outcome in report.outcomes.values() {
            let key = outcome.cache_key.as_ref().expect("key");
            assert!(exec.cache().exists(key).await.expect("exists"));
        }
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let exec = executor(BuildOptions::default());
        let plan = diamond_plan();
        exec.execute(&plan, Arc::new(NoOpRunner)).await.expect("first run");

        let report = exec.execute(&plan, Arc::new(NoOpRunner)).await.expect("second run");
        assert_eq!(report.count(TargetStatus::SkippedUpToDate), 4);

        // Skips append nothing, so a third run sees the same ledger.
        let entries = exec.ledger().load().await.expect("load");
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn command_change_rebuilds_only_downstream() {
        let exec = executor(BuildOptions::default());
        exec.execute(&diamond_plan(), Arc::new(NoOpRunner)).await.expect("first run");

        let changed = Plan::builder()
            .target(Target::new("data", "load()"))
            .target(Target::new("left", "l_v2(data)").dep("data"))
            .target(Target::new("right", "r(data)").dep("data"))
            .target(Target::new("out", "merge(l, r)").dep("left").dep("right"))
            .build()
            .expect("plan");

        let report = exec.execute(&changed, Arc::new(NoOpRunner)).await.expect("second run");
        assert_eq!(report.outcomes["data"].status, TargetStatus::SkippedUpToDate);
        assert_eq!(report.outcomes["right"].status, TargetStatus::SkippedUpToDate);
        assert_eq!(report.outcomes["left"].status, TargetStatus::Built);
        assert_eq!(report.outcomes["out"].status, TargetStatus::Built);
    }

    #[tokio::test]
    async fn failure_skips_transitive_dependents_only() {
        let exec = executor(BuildOptions::default());
        let plan = Plan::builder()
            .target(Target::new("a", "ok()"))
            .target(Target::new("bad", "boom()").dep("a"))
            .target(Target::new("child", "c()").dep("bad"))
            .target(Target::new("island", "i()"))
            .build()
            .expect("plan");

        let report = exec
            .execute(&plan, Arc::new(FailingRunner::new(["bad"])))
            .await
            .expect("run completes despite failure");

        assert_eq!(report.outcomes["a"].status, TargetStatus::Built);
        assert_eq!(report.outcomes["bad"].status, TargetStatus::Failed);
        assert!(report.outcomes["bad"].error.as_deref().unwrap_or("").contains("injected"));
        assert_eq!(
            report.outcomes["child"].status,
            TargetStatus::SkippedUpstreamFailure
        );
        assert_eq!(report.outcomes["island"].status, TargetStatus::Built);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn rename_recovers_without_rebuilding() {
        let exec = executor(BuildOptions::default());
        let original = Plan::builder()
            .target(Target::new("old_name", "expensive()"))
            .build()
            .expect("plan");
        let first = exec.execute(&original, Arc::new(NoOpRunner)).await.expect("first run");
        let original_key = first.outcomes["old_name"].cache_key.clone().expect("key");

        let renamed = Plan::builder()
            .target(Target::new("new_name", "expensive()"))
            .build()
            .expect("plan");
        let second = exec.execute(&renamed, Arc::new(NoOpRunner)).await.expect("second run");

        let outcome = &second.outcomes["new_name"];
        assert_eq!(outcome.status, TargetStatus::Recovered);
        assert_eq!(outcome.cache_key.as_ref(), Some(&original_key));

        // Recovery appends a ledger entry under the new name.
        let entries = exec.ledger().load().await.expect("load");
        assert!(entries.iter().any(|e| e.target == "new_name" && e.recovered));

        // Third run under the new name is a plain skip.
        let third = exec.execute(&renamed, Arc::new(NoOpRunner)).await.expect("third run");
        assert_eq!(
            third.outcomes["new_name"].status,
            TargetStatus::SkippedUpToDate
        );
    }

    #[tokio::test]
    async fn recovery_can_be_disabled() {
        let exec = executor(BuildOptions::default().recover(false));
        let original = Plan::builder()
            .target(Target::new("old_name", "expensive()"))
            .build()
            .expect("plan");
        exec.execute(&original, Arc::new(NoOpRunner)).await.expect("first run");

        let renamed = Plan::builder()
            .target(Target::new("new_name", "expensive()"))
            .build()
            .expect("plan");
        let report = exec.execute(&renamed, Arc::new(NoOpRunner)).await.expect("second run");
        assert_eq!(report.outcomes["new_name"].status, TargetStatus::Built);
    }

    #[tokio::test]
    async fn unsatisfiable_affinity_fails_before_execution() {
        let exec = executor(BuildOptions::default().jobs(2));
        let plan = Plan::builder()
            .target(Target::new("gpu_model", "train()").affinity("gpu"))
            .build()
            .expect("plan");

        let err = exec
            .execute(&plan, Arc::new(NoOpRunner))
            .await
            .expect_err("no gpu slot exists");
        assert!(matches!(err, Error::Scheduling { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn affinity_dispatches_to_tagged_slot() {
        let slots = vec![
            WorkerSlotSpec::new("cpu0"),
            WorkerSlotSpec::new("gpu0").tag("gpu"),
        ];
        let exec = executor(BuildOptions::default().workers(slots));
        let plan = Plan::builder()
            .target(Target::new("anywhere", "a()"))
            .target(Target::new("gpu_model", "train()").affinity("gpu"))
            .build()
            .expect("plan");

        let report = exec.execute(&plan, Arc::new(NoOpRunner)).await.expect("run");
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn parallel_run_matches_serial_outcomes() {
        let plan = diamond_plan();

        let serial = executor(BuildOptions::default().jobs(1));
        let parallel = executor(BuildOptions::default().jobs(4));
        let a = serial.execute(&plan, Arc::new(NoOpRunner)).await.expect("serial");
        let b = parallel.execute(&plan, Arc::new(NoOpRunner)).await.expect("parallel");

        for name in ["data", "left", "right", "out"] {
            assert_eq!(a.outcomes[name].status, TargetStatus::Built);
            assert_eq!(
                a.outcomes[name].cache_key, b.outcomes[name].cache_key,
                "cache key for {name} must not depend on worker count"
            );
            assert_eq!(
                a.outcomes[name].fingerprint, b.outcomes[name].fingerprint,
                "fingerprint for {name} must not depend on worker count"
            );
        }
    }

    #[tokio::test]
    async fn cancellation_marks_undispatched_targets() {
        let exec = executor(BuildOptions::default());
        exec.cancel_handle().cancel();

        let report = exec
            .execute(&diamond_plan(), Arc::new(NoOpRunner))
            .await
            .expect("run returns a report");
        assert_eq!(report.count(TargetStatus::Cancelled), 4);
    }

    #[tokio::test]
    async fn gc_without_history_drops_superseded_artifacts() {
        let exec = executor(BuildOptions::default().garbage_collect(true).keep_history(false));
        let v1 = Plan::builder()
            .target(Target::new("t", "v1()"))
            .build()
            .expect("plan");
        let first = exec.execute(&v1, Arc::new(NoOpRunner)).await.expect("first run");
        let old_key = first.outcomes["t"].cache_key.clone().expect("key");

        let v2 = Plan::builder()
            .target(Target::new("t", "v2()"))
            .build()
            .expect("plan");
        let second = exec.execute(&v2, Arc::new(NoOpRunner)).await.expect("second run");

        assert!(second.gc_removed.contains(&old_key));
        assert!(!exec.cache().exists(&old_key).await.expect("exists"));
    }

    #[tokio::test]
    async fn gc_with_history_keeps_every_ledger_key() {
        let exec = executor(BuildOptions::default().garbage_collect(true));
        let v1 = Plan::builder()
            .target(Target::new("t", "v1()"))
            .build()
            .expect("plan");
        let first = exec.execute(&v1, Arc::new(NoOpRunner)).await.expect("first run");
        let old_key = first.outcomes["t"].cache_key.clone().expect("key");

        let v2 = Plan::builder()
            .target(Target::new("t", "v2()"))
            .build()
            .expect("plan");
        let second = exec.execute(&v2, Arc::new(NoOpRunner)).await.expect("second run");

        assert!(second.gc_removed.is_empty());
        assert!(exec.cache().exists(&old_key).await.expect("exists"));
    }
}
