use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ConductorError, Result};
use crate::task::{RunnerPayload, Task};

/// Everything a runner call gets: the directory to operate in (the task's
/// isolated worktree when isolation is active), per-task environment, and
/// a cancellation signal runners may honor where the underlying operation
/// supports it.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub cancel: watch::Receiver<bool>,
}

impl RunnerContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Pluggable operation that actually performs a task's work. The engine
/// treats this as opaque: it only cares about the result envelope.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Capability name matched against task description keywords.
    fn name(&self) -> &str;

    async fn run(&self, task: &Task, ctx: &RunnerContext) -> Result<RunnerPayload>;
}

/// Registry with keyword-based selection. Selection is a deliberately weak
/// binding: the first runner whose capability name appears in the task
/// description wins, otherwise the first registered runner is used.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) {
        debug!(runner = %runner.name(), "Registered task runner");
        self.runners.push(runner);
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn select(&self, description: &str) -> Result<Arc<dyn TaskRunner>> {
        if self.runners.is_empty() {
            return Err(ConductorError::NoRunnerRegistered);
        }

        let lower = description.to_lowercase();
        let matched = self
            .runners
            .iter()
            .find(|r| lower.contains(&r.name().to_lowercase()));

        Ok(matched.unwrap_or(&self.runners[0]).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedRunner(&'static str);

    #[async_trait]
    impl TaskRunner for NamedRunner {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _task: &Task, _ctx: &RunnerContext) -> Result<RunnerPayload> {
            Ok(RunnerPayload::ok(serde_json::json!({"runner": self.0})))
        }
    }

    #[test]
    fn test_keyword_selection() {
        let mut registry = RunnerRegistry::new();
        registry.register(Arc::new(NamedRunner("build")));
        registry.register(Arc::new(NamedRunner("test")));

        let runner = registry.select("Run test suite for module").unwrap();
        assert_eq!(runner.name(), "test");
    }

    #[test]
    fn test_fallback_to_first_registered() {
        let mut registry = RunnerRegistry::new();
        registry.register(Arc::new(NamedRunner("build")));
        registry.register(Arc::new(NamedRunner("test")));

        let runner = registry.select("Document the API").unwrap();
        assert_eq!(runner.name(), "build");
    }

    #[test]
    fn test_empty_registry_errors() {
        let registry = RunnerRegistry::new();
        assert!(matches!(
            registry.select("anything"),
            Err(ConductorError::NoRunnerRegistered)
        ));
    }
}
