//! Target fingerprinting for change detection and recovery.
//!
//! A fingerprint is a SHA-256 hash over a canonical-JSON document
//! containing:
//!
//! - the normalized command text
//! - the fingerprints of direct dependencies, in graph dependency order
//! - the content hashes of external input files (or an `absent`
//!   sentinel for files that do not exist)
//! - the random seed, if any
//! - the run's environment descriptors
//!
//! The target's *name* is deliberately excluded: two targets with equal
//! fingerprints are semantically identical, which is what makes
//! rename-recovery possible. Fingerprinting is deterministic and
//! side-effect-free; it is computed once per run, in topological order
//! so dependency fingerprints are always available.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_core::{ContentHash, to_canonical_bytes};

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::plan::Plan;

/// Sentinel recorded for a declared input file that does not exist.
///
/// Hashing the absence (rather than erroring) lets a plan declare
/// files that a target will create on first build.
const ABSENT_FILE: &str = "absent";

/// A target's fingerprint: deterministic identity for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(ContentHash);

impl Fingerprint {
    /// Wraps an already-computed content hash.
    ///
    /// Exists for ledger replay and tests; build-time fingerprints
    /// come from [`FingerprintEngine::compute_all`].
    #[must_use]
    pub const fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Returns the underlying content hash.
    #[must_use]
    pub const fn as_hash(&self) -> &ContentHash {
        &self.0
    }

    /// Returns the rendered `sha256:<hex>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pluggable command normalization.
///
/// What counts as a cosmetic versus semantic edit depends on the
/// command language, so normalization is a seam: embedders can supply
/// a canonicalizer that parses their command syntax. The contract is
/// that two commands with equal canonical forms are semantically
/// identical.
pub trait CommandCanonicalizer: Send + Sync {
    /// Returns the canonical form of a command.
    fn canonicalize(&self, command: &str) -> String;
}

/// Default canonicalizer: collapses runs of whitespace to single
/// spaces and trims the ends. Reformatting a command does not force a
/// rebuild; changing any token does.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceCanonicalizer;

impl CommandCanonicalizer for WhitespaceCanonicalizer {
    fn canonicalize(&self, command: &str) -> String {
        command.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// The canonical document a fingerprint hashes. Field names are part
/// of the fingerprint format; changing them invalidates every cache.
#[derive(Debug, Serialize)]
struct FingerprintDocument<'a> {
    command: String,
    deps: Vec<&'a str>,
    env: &'a BTreeMap<String, String>,
    files: BTreeMap<&'a str, String>,
    seed: Option<u64>,
}

/// Computes fingerprints for a plan's targets.
pub struct FingerprintEngine {
    canonicalizer: Arc<dyn CommandCanonicalizer>,
    env: BTreeMap<String, String>,
}

impl FingerprintEngine {
    /// Creates an engine with the default whitespace canonicalizer and
    /// the given environment descriptors.
    #[must_use]
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self {
            canonicalizer: Arc::new(WhitespaceCanonicalizer),
            env,
        }
    }

    /// Replaces the command canonicalizer.
    #[must_use]
    pub fn with_canonicalizer(mut self, canonicalizer: Arc<dyn CommandCanonicalizer>) -> Self {
        self.canonicalizer = canonicalizer;
        self
    }

    /// Computes fingerprints for every target in the plan, in
    /// topological order.
    ///
    /// External input files are read once each, even when several
    /// targets declare the same file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fingerprint`] if an input file exists but
    /// cannot be read, or if serialization of the fingerprint document
    /// fails.
    pub async fn compute_all(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
    ) -> Result<HashMap<String, Fingerprint>> {
        let mut fingerprints: HashMap<String, Fingerprint> = HashMap::with_capacity(plan.len());
        let mut file_hashes: HashMap<String, String> = HashMap::new();

        for name in graph.topo_order() {
            let target = plan.get(name).ok_or_else(|| Error::TargetNotFound {
                name: name.clone(),
            })?;

            let mut deps: Vec<String> = Vec::with_capacity(graph.deps(name).len());
            for dep in graph.deps(name) {
                let dep_fp = fingerprints.get(dep).ok_or_else(|| Error::Fingerprint {
                    target: name.clone(),
                    message: format!("dependency '{dep}' fingerprint not yet computed"),
                })?;
                deps.push(dep_fp.as_str().to_string());
            }

            let mut files: BTreeMap<&str, String> = BTreeMap::new();
            for path in &target.file_inputs {
                if !file_hashes.contains_key(path) {
                    let hash = hash_file(name, path).await?;
                    file_hashes.insert(path.clone(), hash);
                }
                files.insert(path.as_str(), file_hashes[path].clone());
            }

            let doc = FingerprintDocument {
                command: self.canonicalizer.canonicalize(&target.command),
                deps: deps.iter().map(String::as_str).collect(),
                env: &self.env,
                files,
                seed: target.seed,
            };

            let bytes = to_canonical_bytes(&doc).map_err(|e| Error::Fingerprint {
                target: name.clone(),
                message: e.to_string(),
            })?;
            fingerprints.insert(name.clone(), Fingerprint(ContentHash::of(&bytes)));
        }

        Ok(fingerprints)
    }
}

async fn hash_file(target: &str, path: &str) -> Result<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(ContentHash::of(&bytes).as_str().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ABSENT_FILE.to_string()),
        Err(e) => Err(Error::Fingerprint {
            target: target.to_string(),
            message: format!("failed to read input file '{path}': {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::target::Target;

    async fn fingerprint_plan(targets: Vec<Target>) -> HashMap<String, Fingerprint> {
        let plan = Plan::builder()
            .targets(targets)
            .build()
            .expect("plan should be valid");
        let graph = DependencyGraph::build(&plan).expect("graph should build");
        FingerprintEngine::new(BTreeMap::new())
            .compute_all(&plan, &graph)
            .await
            .expect("fingerprinting should succeed")
    }

    #[tokio::test]
    async fn identical_definitions_yield_identical_fingerprints() {
        let a = fingerprint_plan(vec![Target::new("t", "fit(data)")]).await;
        let b = fingerprint_plan(vec![Target::new("t", "fit(data)")]).await;
        assert_eq!(a["t"], b["t"]);
    }

    #[tokio::test]
    async fn name_does_not_affect_fingerprint() {
        let a = fingerprint_plan(vec![Target::new("alpha", "fit(data)")]).await;
        let b = fingerprint_plan(vec![Target::new("beta", "fit(data)")]).await;
        assert_eq!(a["alpha"], b["beta"]);
    }

    #[tokio::test]
    async fn whitespace_edits_are_cosmetic() {
        let a = fingerprint_plan(vec![Target::new("t", "fit(  data ,\n  k = 3 )")]).await;
        let b = fingerprint_plan(vec![Target::new("t", "fit( data , k = 3 )")]).await;
        assert_eq!(a["t"], b["t"]);
    }

    #[tokio::test]
    async fn token_edits_are_semantic() {
        let a = fingerprint_plan(vec![Target::new("t", "fit(data, k = 3)")]).await;
        let b = fingerprint_plan(vec![Target::new("t", "fit(data, k = 4)")]).await;
        assert_ne!(a["t"], b["t"]);
    }

    #[tokio::test]
    async fn seed_changes_fingerprint() {
        let a = fingerprint_plan(vec![Target::new("t", "sim()").seed(1)]).await;
        let b = fingerprint_plan(vec![Target::new("t", "sim()").seed(2)]).await;
        let c = fingerprint_plan(vec![Target::new("t", "sim()")]).await;
        assert_ne!(a["t"], b["t"]);
        assert_ne!(a["t"], c["t"]);
    }

    #[tokio::test]
    async fn dependency_change_propagates_downstream() {
        let before = fingerprint_plan(vec![
            Target::new("up", "one()"),
            Target::new("down", "agg()").dep("up"),
        ])
        .await;
        let after = fingerprint_plan(vec![
            Target::new("up", "two()"),
            Target::new("down", "agg()").dep("up"),
        ])
        .await;

        // "down" itself is unchanged, but its dependency's fingerprint
        // flows into it.
        assert_ne!(before["down"], after["down"]);
    }

    #[tokio::test]
    async fn environment_changes_fingerprint() {
        let plan = Plan::builder()
            .target(Target::new("t", "fit()"))
            .build()
            .expect("plan");
        let graph = DependencyGraph::build(&plan).expect("graph");

        let plain = FingerprintEngine::new(BTreeMap::new())
            .compute_all(&plan, &graph)
            .await
            .expect("fingerprint");
        let with_env = FingerprintEngine::new(BTreeMap::from([(
            "toolchain".to_string(),
            "v2".to_string(),
        )]))
        .compute_all(&plan, &graph)
        .await
        .expect("fingerprint");

        assert_ne!(plain["t"], with_env["t"]);
    }

    #[tokio::test]
    async fn missing_file_uses_sentinel_and_content_matters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("input.csv");
        let path = file.to_string_lossy().to_string();

        let missing =
            fingerprint_plan(vec![Target::new("t", "load()").file_input(path.clone())]).await;

        std::fs::write(&file, b"1,2,3").expect("write input");
        let present =
            fingerprint_plan(vec![Target::new("t", "load()").file_input(path.clone())]).await;

        std::fs::write(&file, b"4,5,6").expect("write input");
        let changed = fingerprint_plan(vec![Target::new("t", "load()").file_input(path)]).await;

        assert_ne!(missing["t"], present["t"]);
        assert_ne!(present["t"], changed["t"]);
    }

    /// Pinned fingerprint values. These fail if the document layout,
    /// canonical JSON rules, or command normalization change, all of
    /// which silently invalidate existing caches and ledgers.
    #[tokio::test]
    async fn fingerprint_format_is_pinned() {
        let plain = fingerprint_plan(vec![Target::new("t", "fit(data)")]).await;
        assert_eq!(
            plain["t"].as_str(),
            "sha256:dc1910d60da7b5adc618c5a6e61221c26c0e50dbbfd1709ac9a06dd7b8d8df4e"
        );

        let plan = Plan::builder()
            .target(Target::new("t", "sim(n  =  100)").seed(42))
            .build()
            .expect("plan");
        let graph = DependencyGraph::build(&plan).expect("graph");
        let seeded = FingerprintEngine::new(BTreeMap::from([(
            "toolchain".to_string(),
            "v2".to_string(),
        )]))
        .compute_all(&plan, &graph)
        .await
        .expect("fingerprint");
        assert_eq!(
            seeded["t"].as_str(),
            "sha256:f784924b9dd81d1822f10d81a548f22fe7745273a92accbf608dd8ceb08aa86f"
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fingerprint_never_depends_on_name(
                name_a in "[a-z]{1,12}",
                name_b in "[a-z]{1,12}",
                command in "[a-z()_ ]{1,40}",
                seed in proptest::option::of(any::<u64>()),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("runtime");

                let fp = |name: &str| {
                    let mut t = Target::new(name, command.clone());
                    t.seed = seed;
                    rt.block_on(fingerprint_plan(vec![t]))
                        .remove(name)
                        .expect("fingerprint computed")
                };

                prop_assert_eq!(fp(&name_a), fp(&name_b));
            }
        }
    }
}
