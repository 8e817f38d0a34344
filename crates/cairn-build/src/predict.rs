//! Run time prediction.
//!
//! The predictor estimates wall-clock time for a run before it starts,
//! using per-target durations from the history ledger (with caller
//! overrides and a default for never-built targets) and a simulation
//! of the scheduler's list dispatch over a worker pool.
//!
//! Estimates are monotone in worker count: adding workers never
//! increases the estimate. Plain list scheduling does not guarantee
//! that on its own, so a uniform pool of `k` workers is estimated as
//! the minimum over simulations with `1..=k` workers. An unbounded
//! pool reduces to the critical path. Every estimate is bounded below
//! by the critical path and above by the serial sum.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::plan::Plan;
use crate::scheduler::WorkerSlotSpec;

/// Worker pool shape for a prediction.
#[derive(Debug, Clone)]
pub enum WorkerPool {
    /// No parallelism limit; the estimate is the critical path.
    Unbounded,
    /// `k` identical untagged workers.
    Uniform(usize),
    /// Explicit slots with affinity tags, as the executor would use.
    Slots(Vec<WorkerSlotSpec>),
}

/// Estimates run durations from historical build times.
#[derive(Debug, Clone, Default)]
pub struct RuntimePredictor {
    durations: BTreeMap<String, u64>,
    overrides: BTreeMap<String, u64>,
    default_duration_ms: u64,
}

impl RuntimePredictor {
    /// Creates a predictor from a duration table, normally
    /// [`LedgerIndex::duration_table`](crate::history::LedgerIndex::duration_table).
    #[must_use]
    pub fn new(durations: BTreeMap<String, u64>) -> Self {
        Self {
            durations,
            overrides: BTreeMap::new(),
            default_duration_ms: 0,
        }
    }

    /// Sets the duration assumed for targets with no history.
    #[must_use]
    pub const fn default_duration_ms(mut self, ms: u64) -> Self {
        self.default_duration_ms = ms;
        self
    }

    /// Overrides the duration for one target, taking precedence over
    /// history.
    #[must_use]
    pub fn override_duration(mut self, target: impl Into<String>, ms: u64) -> Self {
        self.overrides.insert(target.into(), ms);
        self
    }

    fn duration_of(&self, name: &str, skip: &HashSet<String>) -> u64 {
        if skip.contains(name) {
            return 0;
        }
        self.overrides
            .get(name)
            .or_else(|| self.durations.get(name))
            .copied()
            .unwrap_or(self.default_duration_ms)
    }

    /// Predicts the wall-clock milliseconds for building a plan on the
    /// given pool. Targets in `skip` are assumed up to date and cost
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduling`] if a target's affinity has no
    /// compatible slot in the pool.
    pub fn predict(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        pool: &WorkerPool,
        skip: &HashSet<String>,
    ) -> Result<u64> {
        match pool {
            WorkerPool::Unbounded => {
                validate_pool(plan, &WorkerSlotSpec::untagged(1))?;
                Ok(self.critical_path_ms(graph, skip))
            }
            WorkerPool::Uniform(k) => {
                let k = (*k).max(1);
                let mut best = u64::MAX;
                for workers in 1..=k {
                    let slots = WorkerSlotSpec::untagged(workers);
                    best = best.min(self.simulate(plan, graph, &slots, skip)?);
                }
                Ok(best)
            }
            WorkerPool::Slots(slots) => self.simulate(plan, graph, slots, skip),
        }
    }

    /// Length of the longest dependency chain, weighted by duration.
    /// The floor for any estimate, and the exact estimate for an
    /// unbounded pool.
    #[must_use]
    pub fn critical_path_ms(&self, graph: &DependencyGraph, skip: &HashSet<String>) -> u64 {
        let mut finish: HashMap<&str, u64> = HashMap::new();
        let mut longest = 0;
        for name in graph.topo_order() {
            let start = graph
                .deps(name)
                .iter()
                .map(|d| finish.get(d.as_str()).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            let end = start + self.duration_of(name, skip);
            longest = longest.max(end);
            finish.insert(name.as_str(), end);
        }
        longest
    }

    /// Event-driven simulation of list scheduling over explicit slots.
    /// Ready targets dispatch in descending downstream-weight order,
    /// mirroring the executor's preference for unblocking long chains.
    fn simulate(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        slots: &[WorkerSlotSpec],
        skip: &HashSet<String>,
    ) -> Result<u64> {
        validate_pool(plan, slots)?;
        if plan.is_empty() {
            return Ok(0);
        }

        let weight = self.downstream_weight(graph, skip);
        let topo_pos: HashMap<&str, usize> = graph
            .topo_order()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut remaining: HashMap<String, usize> = HashMap::with_capacity(plan.len());
        let mut ready: Vec<String> = Vec::new();
        for target in plan.iter() {
            let count = graph.deps(&target.name).len();
            remaining.insert(target.name.clone(), count);
            if count == 0 {
                ready.push(target.name.clone());
            }
        }

        let mut slot_free = vec![true; slots.len()];
        let mut running: Vec<(u64, usize, String)> = Vec::new();
        let mut now = 0u64;
        let mut done = 0usize;

        while done < plan.len() {
            ready.sort_by_key(|name| {
                (
                    std::cmp::Reverse(weight.get(name.as_str()).copied().unwrap_or(0)),
                    topo_pos.get(name.as_str()).copied().unwrap_or(usize::MAX),
                )
            });

            let mut still_ready = Vec::new();
            for name in ready.drain(..) {
                let target = plan.get(&name).ok_or_else(|| Error::TargetNotFound {
                    name: name.clone(),
                })?;
                let slot = slots
                    .iter()
                    .enumerate()
                    .find(|(i, s)| slot_free[*i] && s.can_run(target))
                    .map(|(i, _)| i);
                match slot {
                    Some(i) => {
                        slot_free[i] = false;
                        running.push((now + self.duration_of(&name, skip), i, name));
                    }
                    None => still_ready.push(name),
                }
            }
            ready = still_ready;

            let Some(&(next, _, _)) = running.iter().min_by_key(|(t, _, _)| *t) else {
                return Err(Error::scheduling(
                    "prediction stalled with unfinished targets and nothing running",
                ));
            };
            now = next;

            let mut still_running = Vec::new();
            for (finish, slot, name) in running.drain(..) {
                if finish > now {
                    still_running.push((finish, slot, name));
                    continue;
                }
                slot_free[slot] = true;
                done += 1;
                for dependent in graph.direct_dependents(&name) {
                    if let Some(count) = remaining.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependent);
                        }
                    }
                }
            }
            running = still_running;
        }

        Ok(now)
    }

    /// Duration-weighted longest path from each target down to a sink,
    /// used as dispatch priority.
    fn downstream_weight(
        &self,
        graph: &DependencyGraph,
        skip: &HashSet<String>,
    ) -> HashMap<String, u64> {
        let mut weight: HashMap<String, u64> = HashMap::new();
        for name in graph.topo_order().iter().rev() {
            let below = graph
                .direct_dependents(name)
                .iter()
                .map(|d| weight.get(d).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            weight.insert(name.clone(), self.duration_of(name, skip) + below);
        }
        weight
    }
}

fn validate_pool(plan: &Plan, slots: &[WorkerSlotSpec]) -> Result<()> {
    for target in plan.iter() {
        if !slots.iter().any(|s| s.can_run(target)) {
            return Err(Error::scheduling(format!(
                "target '{}' has no compatible worker slot in the predicted pool",
                target.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn plan_and_graph(targets: Vec<Target>) -> (Plan, DependencyGraph) {
        let plan = Plan::builder().targets(targets).build().expect("plan");
        let graph = DependencyGraph::build(&plan).expect("graph");
        (plan, graph)
    }

    fn predictor(durations: &[(&str, u64)]) -> RuntimePredictor {
        RuntimePredictor::new(
            durations
                .iter()
                .map(|(n, d)| ((*n).to_string(), *d))
                .collect(),
        )
    }

    fn join_plan() -> (Plan, DependencyGraph) {
        plan_and_graph(vec![
            Target::new("a", "a()"),
            Target::new("b", "b()"),
            Target::new("c", "c(a, b)").dep("a").dep("b"),
        ])
    }

    #[test]
    fn serial_and_two_worker_estimates() {
        let (plan, graph) = join_plan();
        let p = predictor(&[("a", 10), ("b", 10), ("c", 5)]);
        let none = HashSet::new();

        let one = p.predict(&plan, &graph, &WorkerPool::Uniform(1), &none).expect("one");
        let two = p.predict(&plan, &graph, &WorkerPool::Uniform(2), &none).expect("two");
        assert_eq!(one, 25);
        assert_eq!(two, 15);
    }

    #[test]
    fn unbounded_pool_is_the_critical_path() {
        let (plan, graph) = join_plan();
        let p = predictor(&[("a", 10), ("b", 10), ("c", 5)]);
        let none = HashSet::new();

        assert_eq!(
            p.predict(&plan, &graph, &WorkerPool::Unbounded, &none).expect("predict"),
            15
        );
        assert_eq!(p.critical_path_ms(&graph, &none), 15);
    }

    #[test]
    fn estimates_are_monotone_in_worker_count() {
        let (plan, graph) = plan_and_graph(vec![
            Target::new("a", "a()"),
            Target::new("b", "b()"),
            Target::new("c", "c()"),
            Target::new("d", "d()").dep("a"),
            Target::new("e", "e()").dep("b").dep("c"),
            Target::new("f", "f()").dep("d").dep("e"),
        ]);
        let p = predictor(&[("a", 7), ("b", 3), ("c", 9), ("d", 4), ("e", 6), ("f", 2)]);
        let none = HashSet::new();
        let floor = p.critical_path_ms(&graph, &none);
        let serial: u64 = 7 + 3 + 9 + 4 + 6 + 2;

        let mut previous = u64::MAX;
        for workers in 1..=8 {
            let estimate = p
                .predict(&plan, &graph, &WorkerPool::Uniform(workers), &none)
                .expect("predict");
            assert!(estimate <= previous, "{workers} workers increased the estimate");
            assert!(estimate >= floor);
            assert!(estimate <= serial);
            previous = estimate;
        }
    }

    #[test]
    fn skipped_targets_cost_nothing() {
        let (plan, graph) = join_plan();
        let p = predictor(&[("a", 10), ("b", 10), ("c", 5)]);
        let skip: HashSet<String> = HashSet::from(["a".to_string(), "b".to_string()]);

        assert_eq!(
            p.predict(&plan, &graph, &WorkerPool::Uniform(1), &skip).expect("predict"),
            5
        );
    }

    #[test]
    fn overrides_beat_history_and_default_covers_unknowns() {
        let (plan, graph) = plan_and_graph(vec![Target::new("fresh", "f()")]);
        let none = HashSet::new();

        let with_default = predictor(&[]).default_duration_ms(30);
        assert_eq!(
            with_default
                .predict(&plan, &graph, &WorkerPool::Uniform(1), &none)
                .expect("predict"),
            30
        );

        let with_override = predictor(&[("fresh", 100)]).override_duration("fresh", 7);
        assert_eq!(
            with_override
                .predict(&plan, &graph, &WorkerPool::Uniform(1), &none)
                .expect("predict"),
            7
        );
    }

    #[test]
    fn affinity_needs_a_tagged_slot() {
        let (plan, graph) = plan_and_graph(vec![Target::new("gpu_job", "g()").affinity("gpu")]);
        let p = predictor(&[("gpu_job", 40)]);
        let none = HashSet::new();

        assert!(
            p.predict(&plan, &graph, &WorkerPool::Uniform(4), &none).is_err(),
            "untagged pool cannot host a gpu target"
        );

        let slots = vec![
            WorkerSlotSpec::new("cpu0"),
            WorkerSlotSpec::new("gpu0").tag("gpu"),
        ];
        assert_eq!(
            p.predict(&plan, &graph, &WorkerPool::Slots(slots), &none).expect("predict"),
            40
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]
            // Deps only point at earlier targets, so every generated
            // graph is acyclic.
            #[test]
            fn estimates_bounded_and_monotone_on_random_dags(
                specs in prop::collection::vec(
                    (0u64..500, prop::collection::vec(any::<prop::sample::Index>(), 0..3)),
                    1..10,
                )
            ) {
                let mut targets = Vec::new();
                let mut durations = BTreeMap::new();
                for (i, (duration, dep_picks)) in specs.iter().enumerate() {
                    let name = format!("t{i}");
                    let mut target = Target::new(name.clone(), format!("cmd{i}()"));
                    if i > 0 {
                        let mut seen = HashSet::new();
                        for pick in dep_picks {
                            let dep = pick.index(i);
                            if seen.insert(dep) {
                                target = target.dep(format!("t{dep}"));
                            }
                        }
                    }
                    durations.insert(name, *duration);
                    targets.push(target);
                }

                let plan = Plan::builder().targets(targets).build().expect("plan");
                let graph = DependencyGraph::build(&plan).expect("graph");
                let p = RuntimePredictor::new(durations);
                let none = HashSet::new();

                let floor = p.critical_path_ms(&graph, &none);
                let serial: u64 = specs.iter().map(|(d, _)| *d).sum();

                let mut previous = u64::MAX;
                for workers in 1..=4 {
                    let estimate = p
                        .predict(&plan, &graph, &WorkerPool::Uniform(workers), &none)
                        .expect("predict");
                    prop_assert!(estimate >= floor);
                    prop_assert!(estimate <= serial);
                    prop_assert!(estimate <= previous);
                    previous = estimate;
                }

                prop_assert_eq!(
                    p.predict(&plan, &graph, &WorkerPool::Unbounded, &none).expect("predict"),
                    floor
                );
            }
        }
    }

    #[test]
    fn tagged_slots_serialize_contended_targets() {
        let (plan, graph) = plan_and_graph(vec![
            Target::new("g1", "g()").affinity("gpu"),
            Target::new("g2", "g()").affinity("gpu"),
            Target::new("cpu", "c()"),
        ]);
        let p = predictor(&[("g1", 10), ("g2", 10), ("cpu", 10)]);
        let none = HashSet::new();

        // One gpu slot serializes g1 and g2; the cpu target overlaps.
        let slots = vec![
            WorkerSlotSpec::new("cpu0"),
            WorkerSlotSpec::new("gpu0").tag("gpu"),
        ];
        assert_eq!(
            p.predict(&plan, &graph, &WorkerPool::Slots(slots), &none).expect("predict"),
            20
        );
    }
}
