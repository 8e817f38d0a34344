//! Dependency graph construction and validation.
//!
//! The graph is built once per run from a validated [`Plan`]. Edges run
//! from dependency to dependent and come from two sources:
//!
//! - declared dependency names (`Target::deps`)
//! - file matching: a target whose `file_inputs` contain a path that
//!   another target lists in `file_outputs` depends on that producer
//!
//! Validation fails with a [`GraphError`-class](crate::error::Error)
//! error on dangling dependencies, conflicting output declarations, or
//! cycles; no partial graph is ever returned. Nodes are held in a
//! petgraph arena addressed by index, so traversals never chase
//! pointer cycles.

use std::collections::{BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};
use crate::plan::Plan;

/// A validated, acyclic dependency graph over a plan's targets.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    /// Node indices in plan declaration order, for deterministic
    /// tie-breaking.
    insertion_order: Vec<NodeIndex>,
    /// Direct dependencies per target: declared order first, then
    /// file-derived edges in sorted order.
    deps: HashMap<String, Vec<String>>,
    /// Topological order, computed at construction.
    topo: Vec<String>,
}

impl DependencyGraph {
    /// Builds and validates the graph for a plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DanglingDependency`] if a declared dependency
    /// names no target, [`Error::DuplicateOutput`] if two targets claim
    /// the same output file, or [`Error::CycleDetected`] if the edges
    /// form a cycle.
    pub fn build(plan: &Plan) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::with_capacity(plan.len());
        let mut insertion_order = Vec::with_capacity(plan.len());

        for target in plan.iter() {
            let idx = graph.add_node(target.name.clone());
            index_map.insert(target.name.clone(), idx);
            insertion_order.push(idx);
        }

        // Map each declared output file to its producing target.
        let mut producers: HashMap<&str, &str> = HashMap::new();
        for target in plan.iter() {
            for output in &target.file_outputs {
                if let Some(first) = producers.insert(output.as_str(), target.name.as_str()) {
                    return Err(Error::DuplicateOutput {
                        path: output.clone(),
                        first: first.to_string(),
                        second: target.name.clone(),
                    });
                }
            }
        }

        let mut deps: HashMap<String, Vec<String>> = HashMap::with_capacity(plan.len());

        for target in plan.iter() {
            let mut direct: Vec<String> = Vec::new();

            for dep in &target.deps {
                if !plan.contains(dep) {
                    return Err(Error::DanglingDependency {
                        target: target.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                if !direct.contains(dep) {
                    direct.push(dep.clone());
                }
            }

            // File-derived edges, sorted for determinism.
            let mut file_deps: BTreeSet<&str> = BTreeSet::new();
            for input in &target.file_inputs {
                if let Some(&producer) = producers.get(input.as_str()) {
                    if producer != target.name {
                        file_deps.insert(producer);
                    }
                }
            }
            for dep in file_deps {
                if !direct.iter().any(|d| d == dep) {
                    direct.push(dep.to_string());
                }
            }

            let to = index_map[&target.name];
            for dep in &direct {
                let from = index_map[dep];
                graph.add_edge(from, to, ());
            }

            deps.insert(target.name.clone(), direct);
        }

        let topo = toposort(&graph, &insertion_order)?;

        Ok(Self {
            graph,
            index_map,
            insertion_order,
            deps,
            topo,
        })
    }

    /// Returns target names in a deterministic topological order
    /// (dependencies before dependents, ties broken by plan order).
    #[must_use]
    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    /// Returns a target's direct dependencies in deterministic order.
    #[must_use]
    pub fn deps(&self, name: &str) -> &[String] {
        self.deps.get(name).map_or(&[], Vec::as_slice)
    }

    /// Returns a target's direct dependents, in plan order.
    #[must_use]
    pub fn direct_dependents(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.index_map.get(name) else {
            return Vec::new();
        };
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        neighbors.sort_by_key(|n| self.position(*n));
        neighbors
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns all transitive dependents of a target (excluding the
    /// target itself), in plan order.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index_map.get(name) else {
            return Vec::new();
        };

        let mut seen: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut result: Vec<NodeIndex> = seen.into_iter().collect();
        result.sort_by_key(|n| self.position(*n));
        result
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns the number of targets in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn position(&self, idx: NodeIndex) -> usize {
        self.insertion_order
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(usize::MAX)
    }
}

/// Kahn's algorithm with insertion-order tie-breaking. On a cycle,
/// extracts and reports the actual cycle path.
fn toposort(graph: &DiGraph<String, ()>, insertion_order: &[NodeIndex]) -> Result<Vec<String>> {
    let node_count = graph.node_count();
    if node_count == 0 {
        return Ok(Vec::new());
    }

    let mut in_degree: HashMap<NodeIndex, usize> =
        graph.node_indices().map(|idx| (idx, 0)).collect();
    for edge in graph.edge_references() {
        *in_degree.entry(edge.target()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<NodeIndex> = insertion_order
        .iter()
        .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
        .copied()
        .collect();

    let mut result = Vec::with_capacity(node_count);

    while let Some(idx) = queue.pop_front() {
        if let Some(name) = graph.node_weight(idx) {
            result.push(name.clone());
        }

        let mut neighbors: Vec<NodeIndex> =
            graph.neighbors_directed(idx, Direction::Outgoing).collect();
        neighbors.sort_by_key(|n| {
            insertion_order
                .iter()
                .position(|&i| i == *n)
                .unwrap_or(usize::MAX)
        });

        for neighbor in neighbors {
            if let Some(deg) = in_degree.get_mut(&neighbor) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    if result.len() != node_count {
        return Err(Error::CycleDetected {
            cycle: extract_cycle(graph, insertion_order, &in_degree),
        });
    }

    Ok(result)
}

/// Walks predecessor edges among the nodes Kahn's algorithm could not
/// retire until a node repeats; the repeated segment is a cycle.
fn extract_cycle(
    graph: &DiGraph<String, ()>,
    insertion_order: &[NodeIndex],
    in_degree: &HashMap<NodeIndex, usize>,
) -> Vec<String> {
    let remaining = |idx: NodeIndex| in_degree.get(&idx).copied().unwrap_or(0) > 0;

    let Some(&start) = insertion_order.iter().find(|&&idx| remaining(idx)) else {
        return Vec::new();
    };

    let mut path: Vec<NodeIndex> = vec![start];
    let mut current = start;

    loop {
        // Every remaining node has at least one remaining predecessor,
        // so this walk always closes a loop.
        let mut preds: Vec<NodeIndex> = graph
            .neighbors_directed(current, Direction::Incoming)
            .filter(|&n| remaining(n))
            .collect();
        preds.sort_by_key(|n| {
            insertion_order
                .iter()
                .position(|&i| i == *n)
                .unwrap_or(usize::MAX)
        });
        let Some(&pred) = preds.first() else {
            break;
        };

        if let Some(pos) = path.iter().position(|&n| n == pred) {
            // path[pos..] walked dependents-to-dependencies; reverse it
            // so the report reads in dependency order.
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .rev()
                .filter_map(|&i| graph.node_weight(i).cloned())
                .collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }

        path.push(pred);
        current = pred;
    }

    Vec::new()
}
