//! Target definitions.
//!
//! A target is a named, cacheable unit of computation: a command plus
//! its declared dependencies. Targets are immutable for the duration of
//! one run; the plan layer owns their construction.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::memory::MemoryStrategy;

/// A named, cacheable unit of computation.
///
/// The `command` is opaque to the engine: fingerprinting normalizes its
/// text and the [`Runner`](crate::runner::Runner) interprets it. All
/// collection fields use ordered containers so that serializing a
/// target is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Unique name within the plan.
    pub name: String,
    /// The command text executed by the runner.
    pub command: String,
    /// Names of targets this target depends on, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    /// External input files whose content participates in the
    /// fingerprint. Paths matching another target's declared output
    /// also create a dependency edge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_inputs: Vec<String>,
    /// Files this target's command produces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_outputs: Vec<String>,
    /// Fixed random seed, if the command is stochastic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Per-target override of the run-wide memory strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_strategy: Option<MemoryStrategy>,
    /// Worker-affinity tags. Empty means any worker slot may build
    /// this target; non-empty restricts dispatch to slots sharing at
    /// least one tag.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub affinity: BTreeSet<String>,
}

impl Target {
    /// Creates a target with the given name and command and no
    /// dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            deps: Vec::new(),
            file_inputs: Vec::new(),
            file_outputs: Vec::new(),
            seed: None,
            memory_strategy: None,
            affinity: BTreeSet::new(),
        }
    }

    /// Adds a dependency on another target.
    #[must_use]
    pub fn dep(mut self, name: impl Into<String>) -> Self {
        self.deps.push(name.into());
        self
    }

    /// Declares an external input file.
    #[must_use]
    pub fn file_input(mut self, path: impl Into<String>) -> Self {
        self.file_inputs.push(path.into());
        self
    }

    /// Declares an output file.
    #[must_use]
    pub fn file_output(mut self, path: impl Into<String>) -> Self {
        self.file_outputs.push(path.into());
        self
    }

    /// Sets a fixed random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Overrides the run-wide memory strategy for this target.
    #[must_use]
    pub const fn memory_strategy(mut self, strategy: MemoryStrategy) -> Self {
        self.memory_strategy = Some(strategy);
        self
    }

    /// Adds a worker-affinity tag.
    #[must_use]
    pub fn affinity(mut self, tag: impl Into<String>) -> Self {
        self.affinity.insert(tag.into());
        self
    }

    /// Returns the effective memory strategy given the run-wide default.
    #[must_use]
    pub fn effective_strategy(&self, default: MemoryStrategy) -> MemoryStrategy {
        self.memory_strategy.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_fields() {
        let t = Target::new("model", "fit(data)")
            .dep("data")
            .file_input("params.yaml")
            .seed(42)
            .affinity("gpu");

        assert_eq!(t.name, "model");
        assert_eq!(t.deps, vec!["data"]);
        assert_eq!(t.file_inputs, vec!["params.yaml"]);
        assert_eq!(t.seed, Some(42));
        assert!(t.affinity.contains("gpu"));
    }

    #[test]
    fn effective_strategy_prefers_override() {
        let plain = Target::new("a", "c");
        assert_eq!(
            plain.effective_strategy(MemoryStrategy::Speed),
            MemoryStrategy::Speed
        );

        let overridden = Target::new("b", "c").memory_strategy(MemoryStrategy::Unload);
        assert_eq!(
            overridden.effective_strategy(MemoryStrategy::Speed),
            MemoryStrategy::Unload
        );
    }

    #[test]
    fn serde_omits_empty_collections() {
        let t = Target::new("a", "c");
        let json = serde_json::to_string(&t).expect("serialize");
        assert!(!json.contains("deps"));
        assert!(!json.contains("affinity"));
    }
}
