//! Command execution seam.
//!
//! The engine never interprets command text itself. Embedders implement
//! [`Runner`] to give commands meaning; the scheduler hands each
//! dispatched target a [`BuildContext`] and stores whatever bytes the
//! runner returns. The runners in this module exist for tests and for
//! plans where only the caching and scheduling behavior matters.

use async_trait::async_trait;
use bytes::Bytes;

use cairn_core::RunId;

use crate::error::{Error, Result};
use crate::memory::DepValues;

/// Everything a runner needs to execute one target.
pub struct BuildContext {
    /// Name of the target being built.
    pub target: String,
    /// The target's command text, as declared (not normalized).
    pub command: String,
    /// Fixed seed for stochastic commands, if declared.
    pub seed: Option<u64>,
    /// The run this build belongs to.
    pub run_id: RunId,
    /// Pull-based access to dependency values.
    pub deps: DepValues,
}

/// Executes a target's command and produces its value.
///
/// Implementations must be deterministic given the context: the same
/// command, dependency values, and seed must produce the same bytes.
/// Returning an error fails the target; its dependents are skipped and
/// unrelated targets continue.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Runs one target to completion.
    ///
    /// # Errors
    ///
    /// Any error fails the target. [`Error::CacheConsistency`] aborts
    /// the whole run; everything else stays scoped to this target.
    async fn run(&self, ctx: &BuildContext) -> Result<Bytes>;
}

/// Runner that produces each target's command text as its value.
///
/// Useful for exercising scheduling, caching, and recovery without
/// real computation: the value changes exactly when the command does.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRunner;

#[async_trait]
impl Runner for NoOpRunner {
    async fn run(&self, ctx: &BuildContext) -> Result<Bytes> {
        Ok(Bytes::from(ctx.command.clone()))
    }
}

/// Runner that fails targets whose name is in its deny list and
/// otherwise behaves like [`NoOpRunner`].
#[derive(Debug, Clone, Default)]
pub struct FailingRunner {
    failures: Vec<String>,
}

impl FailingRunner {
    /// Creates a runner that fails the named targets.
    #[must_use]
    pub fn new(failures: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            failures: failures.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Runner for FailingRunner {
    async fn run(&self, ctx: &BuildContext) -> Result<Bytes> {
        if self.failures.iter().any(|name| name == &ctx.target) {
            return Err(Error::build(&ctx.target, "injected failure"));
        }
        Ok(Bytes::from(ctx.command.clone()))
    }
}

/// Runner backed by a synchronous closure.
///
/// The closure sees the full context, including resident dependency
/// values through [`DepValues::resident`]. Commands that need to pull
/// cold values from the cache need a real [`Runner`] implementation.
pub struct FnRunner<F> {
    f: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&BuildContext) -> Result<Bytes> + Send + Sync + 'static,
{
    /// Wraps a closure as a runner.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Runner for FnRunner<F>
where
    F: Fn(&BuildContext) -> Result<Bytes> + Send + Sync + 'static,
{
    async fn run(&self, ctx: &BuildContext) -> Result<Bytes> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::memory::MemoryState;
    use cairn_core::MemoryBackend;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn context(target: &str, command: &str) -> BuildContext {
        BuildContext {
            target: target.to_string(),
            command: command.to_string(),
            seed: None,
            run_id: RunId::generate(),
            deps: DepValues::new(
                Vec::new(),
                HashMap::new(),
                Arc::new(MemoryState::new()),
                CacheStore::new(Arc::new(MemoryBackend::new())),
            ),
        }
    }

    #[tokio::test]
    async fn noop_runner_echoes_command() {
        let out = NoOpRunner.run(&context("t", "fit(data)")).await.expect("run");
        assert_eq!(out, Bytes::from("fit(data)"));
    }

    #[tokio::test]
    async fn failing_runner_fails_only_listed_targets() {
        let runner = FailingRunner::new(["bad"]);
        assert!(runner.run(&context("bad", "x")).await.is_err());
        assert!(runner.run(&context("good", "x")).await.is_ok());
    }

    #[tokio::test]
    async fn fn_runner_sees_context() {
        let runner = FnRunner::new(|ctx: &BuildContext| {
            Ok(Bytes::from(format!("{}:{}", ctx.target, ctx.command)))
        });
        let out = runner.run(&context("t", "cmd")).await.expect("run");
        assert_eq!(out, Bytes::from("t:cmd"));
    }
}
