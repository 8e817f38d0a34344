//! Build plans.
//!
//! A plan is the validated, immutable collection of targets for one
//! run. Plans are:
//!
//! - **Deterministic**: the same targets always produce the same plan
//!   digest
//! - **Serializable**: plans can be stored and diffed for debugging
//!
//! Name uniqueness is enforced here; structural validation (dangling
//! dependencies, cycles) happens when the dependency graph is built.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, to_canonical_bytes};

use crate::error::{Error, Result};
use crate::target::Target;

/// A validated collection of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Targets in declaration order.
    pub targets: Vec<Target>,
    /// Deterministic digest of the declared targets, for provenance.
    pub digest: ContentHash,
    /// Name-to-position index.
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Plan {
    /// Starts building a plan.
    #[must_use]
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }

    /// Returns the target with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.index.get(name).and_then(|&i| self.targets.get(i))
    }

    /// Returns true if the plan declares a target with this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if the plan has no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Iterates over targets in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    /// Rebuilds the name index after deserialization.
    ///
    /// `serde` skips the index field, so a deserialized plan must call
    /// this before lookups.
    pub fn reindex(&mut self) {
        self.index = build_index(&self.targets);
    }
}

fn build_index(targets: &[Target]) -> HashMap<String, usize> {
    targets
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect()
}

/// Builder for [`Plan`].
#[derive(Debug, Default)]
pub struct PlanBuilder {
    targets: Vec<Target>,
}

impl PlanBuilder {
    /// Adds a target to the plan.
    #[must_use]
    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// Adds several targets to the plan.
    #[must_use]
    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Validates names and produces the plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTarget`] if two targets share a name.
    pub fn build(self) -> Result<Plan> {
        let mut seen = HashMap::with_capacity(self.targets.len());
        for (i, target) in self.targets.iter().enumerate() {
            if seen.insert(target.name.clone(), i).is_some() {
                return Err(Error::DuplicateTarget {
                    name: target.name.clone(),
                });
            }
        }

        let digest = ContentHash::of(&to_canonical_bytes(&self.targets)?);
        let index = build_index(&self.targets);

        Ok(Plan {
            targets: self.targets,
            digest,
            index,
        })
    }
}
